use std::{future::Future, io};

use tokio::select;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

/// Cancels `cancelation` once the user interrupts the process with Ctrl-C.
///
/// Returns early without cancelling if the recording finished some other way. If interrupts can't
/// be listened for the token is left alone and the error is returned.
pub async fn detect_shutdown(cancelation: CancellationToken) -> io::Result<()> {
    cancel_on(cancelation, tokio::signal::ctrl_c()).await
}

async fn cancel_on(
    cancelation: CancellationToken,
    signal: impl Future<Output = io::Result<()>>,
) -> io::Result<()> {
    select! {
        signal = signal => {
            signal.inspect_err(|e| error!("Failed to listen for interrupts {e:?}"))?;
            info!("Received interrupt");
            cancelation.cancel();
        },
        _ = cancelation.cancelled() => (),
    };
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::{future, io};

    use tokio_util::sync::CancellationToken;

    use super::cancel_on;

    #[tokio::test]
    async fn interrupt_cancels() -> io::Result<()> {
        let token = CancellationToken::new();
        cancel_on(token.clone(), future::ready(Ok(()))).await?;
        assert!(token.is_cancelled());
        Ok(())
    }

    #[tokio::test]
    async fn listener_failure_is_returned_without_cancelling() {
        let token = CancellationToken::new();
        let result = cancel_on(
            token.clone(),
            future::ready(Err(io::Error::other("signal driver is gone"))),
        )
        .await;

        assert!(result.is_err());
        assert!(!token.is_cancelled());
    }

    #[tokio::test]
    async fn finished_recording_stops_listening() -> io::Result<()> {
        let token = CancellationToken::new();
        token.cancel();
        cancel_on(token, future::pending()).await
    }
}
