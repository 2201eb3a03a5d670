use std::{future::Future, io, process::ExitCode, sync::Arc};

use futures::future;
use hma_warden::{subscriber::KubeCluster, Config, RunError, Warden};
use log::{error, info, warn};
use tokio::signal::unix::{signal, SignalKind};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    match run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            let mut msg = err.to_string();
            let mut source = std::error::Error::source(&err);
            while let Some(cause) = source {
                msg.push_str(&format!(": {cause}"));
                source = cause.source();
            }
            error!("{msg}");
            ExitCode::FAILURE
        }
    }
}

async fn run() -> Result<(), RunError> {
    let config = Config::from_env()?;
    let client = kube_client::Client::try_default()
        .await
        .map_err(RunError::Client)?;
    info!("initialized cluster client");

    let cancel = CancellationToken::new();
    tokio::spawn(cancel_on_signal(cancel.clone()));

    Warden::new(Arc::new(KubeCluster::new(client)), config)
        .run(cancel)
        .await?;
    info!("shut down cleanly");
    Ok(())
}

async fn cancel_on_signal(cancel: CancellationToken) {
    let terminate = match signal(SignalKind::terminate()) {
        Ok(mut term) => Some(async move {
            term.recv().await;
        }),
        Err(err) => {
            warn!("cannot listen for SIGTERM, falling back to SIGINT only: {err}");
            None
        }
    };
    cancel_on_first(cancel, terminate, tokio::signal::ctrl_c()).await;
}

/// Cancels on whichever of SIGTERM or SIGINT arrives first. A missing or
/// broken listener leaves the other one in charge.
async fn cancel_on_first(
    cancel: CancellationToken,
    terminate: Option<impl Future<Output = ()>>,
    interrupt: impl Future<Output = io::Result<()>>,
) {
    let terminate = async {
        match terminate {
            Some(recv) => recv.await,
            None => future::pending().await,
        }
    };
    tokio::pin!(terminate);
    tokio::select! {
        result = interrupt => match result {
            Ok(()) => info!("received SIGINT"),
            Err(err) => {
                error!("cannot listen for SIGINT: {err}");
                (&mut terminate).await;
                info!("received SIGTERM");
            }
        },
        () = &mut terminate => info!("received SIGTERM"),
    }
    cancel.cancel();
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[tokio::test]
    async fn interrupt_alone_cancels() {
        let cancel = CancellationToken::new();
        let interrupt = future::ready(Ok::<(), io::Error>(()));
        cancel_on_first(cancel.clone(), None::<future::Ready<()>>, interrupt).await;
        assert!(cancel.is_cancelled());
    }

    #[tokio::test]
    async fn terminate_cancels_while_interrupt_waits() {
        let cancel = CancellationToken::new();
        let interrupt = future::pending::<io::Result<()>>();
        cancel_on_first(cancel.clone(), Some(future::ready(())), interrupt).await;
        assert!(cancel.is_cancelled());
    }

    #[tokio::test]
    async fn broken_interrupt_leaves_terminate_listening() {
        let cancel = CancellationToken::new();
        let broken = future::ready(Err(io::Error::other("no handler")));
        let task = tokio::spawn(cancel_on_first(cancel.clone(), None::<future::Ready<()>>, broken));
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!cancel.is_cancelled());
        assert!(!task.is_finished());
        task.abort();
    }
}
