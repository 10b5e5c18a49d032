//! Helpers shared by unit tests.

use std::io;

use futures_util::StreamExt;
use tonic::transport::Server;

use crate::conn::Connection;

/// One end of an in-memory pipe whose other end is served by a
/// `grpc.health.v1.Health` service reporting `SERVING`.
pub(crate) fn served_connection() -> Connection {
    let (client_io, server_io) = tokio::io::duplex(64 * 1024);
    let (_reporter, health) = tonic_health::server::health_reporter();
    // Keep the stream open so the server does not shut down after one item.
    let incoming = futures_util::stream::iter(vec![Ok::<_, io::Error>(Connection::new(server_io))])
        .chain(futures_util::stream::pending());
    tokio::spawn(
        Server::builder()
            .add_service(health)
            .serve_with_incoming(incoming),
    );
    Connection::new(client_io)
}
