use std::sync::Arc;

use tokio::sync::mpsc::UnboundedSender;
use tracing::{debug, error};

use crate::net::Package;
use crate::state::document::{ErrReply, LogRequest, StateDocument};
use crate::state::{State, StateError};

pub const PROTO_RAPP_PING: u8 = 0x40; // empty
pub const PROTO_RAPP_READ: u8 = 0x41; // empty
pub const PROTO_RAPP_PUSH: u8 = 0x42; // declared-state document
pub const PROTO_RAPP_UPDATE: u8 = 0x43; // empty
pub const PROTO_RAPP_LOG: u8 = 0x44; // {"name": "wmi-probe", "start": 0}

pub const PROTO_RAPP_RES: u8 = 0x50; // request specific or empty
pub const PROTO_RAPP_NO_AC: u8 = 0x51; // reserved
pub const PROTO_RAPP_NO_CONNECTION: u8 = 0x52; // reserved
pub const PROTO_RAPP_BUSY: u8 = 0x53; // empty
pub const PROTO_RAPP_ERR: u8 = 0x54; // {"reason": "..."}

/// Routes one inbound frame. A held mutation gate means BUSY for every
/// request; unknown request types are logged and dropped without a reply.
pub fn dispatch(state: &Arc<State>, pkg: Package, replies: &UnboundedSender<Package>) {
    match pkg.tp {
        PROTO_RAPP_PING | PROTO_RAPP_READ | PROTO_RAPP_PUSH | PROTO_RAPP_UPDATE
        | PROTO_RAPP_LOG => {}
        other => {
            error!("unhandled package type: 0x{other:02x}");
            return;
        }
    }

    if state.docker().gate().is_held() {
        let _ = replies.send(Package::empty(PROTO_RAPP_BUSY, pkg.pid));
        return;
    }

    let state = Arc::clone(state);
    let replies = replies.clone();
    tokio::spawn(async move {
        handle(state, pkg, replies).await;
    });
}

async fn handle(state: Arc<State>, pkg: Package, replies: UnboundedSender<Package>) {
    let pid = pkg.pid;
    let result = match pkg.tp {
        PROTO_RAPP_PING => {
            debug!("ping");
            Ok(Package::empty(PROTO_RAPP_RES, pid))
        }
        PROTO_RAPP_READ => on_read(&state, pid).await,
        PROTO_RAPP_PUSH => on_push(&state, &pkg.data, pid).await,
        PROTO_RAPP_UPDATE => on_update(&state, pid),
        PROTO_RAPP_LOG => on_log(&state, &pkg.data, pid).await,
        _ => return,
    };

    let reply = result.unwrap_or_else(|err| {
        if cfg!(debug_assertions) {
            error!("request failed: {err:?}");
        } else {
            error!("request failed: {err}");
        }
        err_reply(&err, pid)
    });
    // a send failure means the connection is gone; the reply is moot
    let _ = replies.send(reply);
}

async fn on_read(state: &Arc<State>, pid: u16) -> Result<Package, StateError> {
    debug!("read");
    let doc = state.get().await;
    res_reply(&doc, pid)
}

async fn on_push(state: &Arc<State>, data: &[u8], pid: u16) -> Result<Package, StateError> {
    debug!("push");
    let doc: StateDocument = serde_json::from_slice(data)
        .map_err(|err| StateError::BadRequest(err.to_string()))?;
    state.set(doc).await?;

    // the runtime work happens after the reply; observers should poll
    let state = Arc::clone(state);
    tokio::spawn(async move {
        if let Err(err) = state.update(false, false).await {
            error!("update after push failed: {err}");
        }
    });
    Ok(Package::empty(PROTO_RAPP_RES, pid))
}

fn on_update(state: &Arc<State>, pid: u16) -> Result<Package, StateError> {
    debug!("update");
    let state = Arc::clone(state);
    tokio::spawn(async move {
        if let Err(err) = state.update(true, false).await {
            error!("update failed: {err}");
        }
    });
    Ok(Package::empty(PROTO_RAPP_RES, pid))
}

async fn on_log(state: &Arc<State>, data: &[u8], pid: u16) -> Result<Package, StateError> {
    debug!("log");
    let request: LogRequest = serde_json::from_slice(data)
        .map_err(|err| StateError::BadRequest(err.to_string()))?;
    let page = state.get_log(&request.name, request.start as usize).await?;
    res_reply(&page, pid)
}

fn res_reply<T: serde::Serialize>(payload: &T, pid: u16) -> Result<Package, StateError> {
    let data = serde_json::to_vec(payload)
        .map_err(|err| StateError::BadRequest(format!("encoding reply: {err}")))?;
    Ok(Package::new(PROTO_RAPP_RES, pid, data))
}

fn err_reply(err: &StateError, pid: u16) -> Package {
    let reply = ErrReply {
        reason: err.to_string(),
    };
    let data = serde_json::to_vec(&reply).unwrap_or_default();
    Package::new(PROTO_RAPP_ERR, pid, data)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_and_reply_codes_are_stable() {
        assert_eq!(PROTO_RAPP_PING, 0x40);
        assert_eq!(PROTO_RAPP_LOG, 0x44);
        assert_eq!(PROTO_RAPP_RES, 0x50);
        assert_eq!(PROTO_RAPP_NO_AC, 0x51);
        assert_eq!(PROTO_RAPP_NO_CONNECTION, 0x52);
        assert_eq!(PROTO_RAPP_BUSY, 0x53);
        assert_eq!(PROTO_RAPP_ERR, 0x54);
    }

    #[test]
    fn err_reply_carries_reason() {
        let pkg = err_reply(&StateError::NoSuchService("nosuch".to_string()), 7);
        assert_eq!(pkg.tp, PROTO_RAPP_ERR);
        assert_eq!(pkg.pid, 7);
        let value: serde_json::Value = serde_json::from_slice(&pkg.data).unwrap();
        assert_eq!(
            value.get("reason").unwrap(),
            "no running services named 'nosuch'"
        );
    }
}
