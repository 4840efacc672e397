use std::io::ErrorKind;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::{sleep, timeout};
use tracing::{debug, error, info, warn};

use crate::net::{Package, PackageError};
use crate::protocol;
use crate::state::State;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const INITIAL_DELAY: u64 = 2;
const MAX_DELAY: u64 = 128;

/// Maintains the single outbound session to agentcore. Failed attempts back
/// off with a doubling delay; a successful connection resets it.
pub async fn run(state: Arc<State>) {
    let env = Arc::clone(state.environment());
    let address = format!("{}:{}", env.agentcore_host, env.agentcore_port);
    let mut delay = INITIAL_DELAY;

    loop {
        match timeout(CONNECT_TIMEOUT, TcpStream::connect(&address)).await {
            Ok(Ok(stream)) => {
                info!(%address, "connected to agentcore");
                delay = INITIAL_DELAY;
                serve(Arc::clone(&state), stream).await;
                warn!("connection to agentcore lost");
            }
            Ok(Err(err)) => error!("connecting to agentcore failed: {err}"),
            Err(_) => error!("connecting to agentcore timed out"),
        }
        sleep(Duration::from_secs(delay)).await;
        delay = next_delay(delay);
    }
}

fn next_delay(delay: u64) -> u64 {
    (delay * 2).min(MAX_DELAY)
}

/// Reads frames until the stream breaks. Replies flow through a channel to
/// a dedicated writer so handlers can finish in any order.
async fn serve(state: Arc<State>, stream: TcpStream) {
    let (mut reader, mut writer) = stream.into_split();
    let (tx, mut rx) = mpsc::unbounded_channel::<Package>();

    let writer_task = tokio::spawn(async move {
        while let Some(pkg) = rx.recv().await {
            if let Err(err) = writer.write_all(&pkg.to_bytes()).await {
                error!("failed to write reply: {err}");
                break;
            }
        }
    });

    loop {
        match Package::read_from(&mut reader).await {
            Ok(pkg) => protocol::dispatch(&state, pkg, &tx),
            Err(PackageError::Io(err)) if err.kind() == ErrorKind::UnexpectedEof => {
                debug!("connection closed by peer");
                break;
            }
            Err(err) => {
                // no way to resync mid-stream, drop and reconnect
                error!("dropping connection: {err}");
                break;
            }
        }
    }

    writer_task.abort();
}
