//! The process-wide client is global state, so it gets a test binary of its own.

use backdial::{BoxError, Error};

#[tokio::test]
async fn test_default_client_lifecycle() {
    assert!(matches!(
        backdial::dial("edge-1").await,
        Err(Error::NotInitialized)
    ));
    assert!(matches!(
        backdial::each(|_, _| async { Ok::<(), BoxError>(()) }).await,
        Err(Error::NotInitialized)
    ));

    backdial::init_client("127.0.0.1:0", &[]).await.unwrap();
    assert!(matches!(
        backdial::init_client("127.0.0.1:0", &[]).await,
        Err(Error::AlreadyInitialized)
    ));

    assert!(matches!(
        backdial::dial("edge-1").await,
        Err(Error::NotFound(ref id)) if id == "edge-1"
    ));
    backdial::each(|_, _| async { Ok::<(), BoxError>(()) })
        .await
        .unwrap();
}
