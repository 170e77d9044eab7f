//! JSON-lines control socket. Each line is one request object carrying a
//! `command` field; each reply is one JSON object on its own line. Failed
//! requests answer with `error` and the matching `status` code.

use std::{
    fs,
    io::{self, BufRead, BufReader, Write},
    os::unix::net::{UnixListener, UnixStream},
    path::{Path, PathBuf},
    sync::Arc,
    thread::JoinHandle,
};

use log::{error, info, warn};
use serde::Deserialize;
use serde_json::{json, Value};

use crate::format::Guid;
use crate::manager::{PartitionRequest, VolumeManager};
use crate::{fvm_error, Result, UbifvmError};

const VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Debug, Deserialize)]
#[serde(tag = "command", rename_all = "snake_case")]
enum RpcRequest {
    Version,
    Info,
    List,
    Allocate {
        type_guid: Guid,
        instance_guid: Guid,
        name: String,
        slice_count: u64,
        #[serde(default)]
        flags: u32,
    },
    Extend {
        instance_guid: Guid,
        vslice_start: u64,
        count: u64,
    },
    Shrink {
        instance_guid: Guid,
        vslice_start: u64,
        count: u64,
    },
    Destroy {
        instance_guid: Guid,
    },
    Activate {
        old_guid: Guid,
        new_guid: Guid,
    },
    SetName {
        instance_guid: Guid,
        name: String,
    },
    SetLimit {
        instance_guid: Guid,
        bytes: u64,
    },
    QuerySlices {
        instance_guid: Guid,
        vslice_starts: Vec<u64>,
    },
    Grow {
        /// Defaults to the size of the underlying device.
        #[serde(default)]
        device_size: Option<u64>,
    },
}

pub fn start_rpc_server<P: AsRef<Path>>(
    path: P,
    manager: Arc<VolumeManager>,
) -> Result<JoinHandle<()>> {
    let path = path.as_ref().to_path_buf();
    if let Err(e) = fs::remove_file(&path) {
        if e.kind() != io::ErrorKind::NotFound {
            return Err(fvm_error!(RpcError {
                description: format!("failed to remove existing RPC socket {path:?}: {e}"),
            }));
        }
    }

    let listener = UnixListener::bind(&path).map_err(|e| {
        fvm_error!(RpcError {
            description: format!("failed to bind RPC socket {path:?}: {e}"),
        })
    })?;

    info!("RPC server listening on {path:?}");

    std::thread::Builder::new()
        .name("ubifvm-rpc-listener".to_string())
        .spawn(move || run_listener(listener, manager, path))
        .map_err(|e| fvm_error!(ThreadCreation { source: e }))
}

fn run_listener(listener: UnixListener, manager: Arc<VolumeManager>, path: PathBuf) {
    for stream in listener.incoming() {
        match stream {
            Ok(stream) => {
                let manager = manager.clone();
                if let Err(e) = std::thread::Builder::new()
                    .name("ubifvm-rpc-client".to_string())
                    .spawn(move || handle_client(stream, manager))
                {
                    error!("Failed to spawn RPC handler thread: {e}");
                }
            }
            Err(e) => {
                if e.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                error!("RPC listener error on {path:?}: {e}");
                break;
            }
        }
    }

    if let Err(e) = fs::remove_file(&path) {
        if e.kind() != io::ErrorKind::NotFound {
            warn!("Failed to remove RPC socket {path:?}: {e}");
        }
    }
}

fn handle_client(stream: UnixStream, manager: Arc<VolumeManager>) {
    let mut reader = BufReader::new(stream);
    let mut line = String::new();

    loop {
        line.clear();
        match reader.read_line(&mut line) {
            Ok(0) => break,
            Ok(_) => {
                let trimmed = line.trim();
                if trimmed.is_empty() {
                    continue;
                }

                let response = match serde_json::from_str::<RpcRequest>(trimmed) {
                    Ok(request) => match process_request(request, &manager) {
                        Ok(value) => value,
                        Err(e) => error_response(&e),
                    },
                    Err(e) => error_response(&UbifvmError::from(e)),
                };

                if let Err(e) = send_response(reader.get_mut(), &response) {
                    error!("Failed to send RPC response: {e}");
                    break;
                }
            }
            Err(e) => {
                error!("Failed to read RPC request: {e}");
                break;
            }
        }
    }
}

fn error_response(e: &UbifvmError) -> Value {
    warn!("RPC request failed: {e}");
    json!({
        "error": e.to_string(),
        "status": e.status(),
    })
}

fn process_request(request: RpcRequest, manager: &Arc<VolumeManager>) -> Result<Value> {
    Ok(match request {
        RpcRequest::Version => json!({ "version": VERSION }),
        RpcRequest::Info => json!({ "info": manager.query_info()? }),
        RpcRequest::List => json!({ "partitions": manager.list_partitions()? }),
        RpcRequest::Allocate {
            type_guid,
            instance_guid,
            name,
            slice_count,
            flags,
        } => {
            let partition = manager.allocate_partition(&PartitionRequest {
                type_guid,
                instance_guid,
                name,
                slice_count,
                flags,
            })?;
            json!({ "partition": partition.info()? })
        }
        RpcRequest::Extend {
            instance_guid,
            vslice_start,
            count,
        } => {
            let partition = manager.find_partition(&instance_guid)?;
            partition.extend(vslice_start, count)?;
            json!({ "partition": partition.info()? })
        }
        RpcRequest::Shrink {
            instance_guid,
            vslice_start,
            count,
        } => {
            let partition = manager.find_partition(&instance_guid)?;
            partition.shrink(vslice_start, count)?;
            json!({ "partition": partition.info()? })
        }
        RpcRequest::Destroy { instance_guid } => {
            manager.find_partition(&instance_guid)?.destroy()?;
            json!({ "destroyed": instance_guid })
        }
        RpcRequest::Activate { old_guid, new_guid } => {
            manager.activate(&old_guid, &new_guid)?;
            json!({ "active": new_guid })
        }
        RpcRequest::SetName {
            instance_guid,
            name,
        } => {
            let partition = manager.find_partition(&instance_guid)?;
            partition.set_name(&name)?;
            json!({ "partition": partition.info()? })
        }
        RpcRequest::SetLimit {
            instance_guid,
            bytes,
        } => {
            let partition = manager.find_partition(&instance_guid)?;
            partition.set_byte_limit(bytes)?;
            json!({ "partition": partition.info()? })
        }
        RpcRequest::QuerySlices {
            instance_guid,
            vslice_starts,
        } => {
            let partition = manager.find_partition(&instance_guid)?;
            json!({ "ranges": partition.query_slices(&vslice_starts)? })
        }
        RpcRequest::Grow { device_size } => {
            let size = device_size.unwrap_or_else(|| manager.device_size());
            json!({ "slice_count": manager.grow(size)? })
        }
    })
}

fn send_response(stream: &mut UnixStream, response: &Value) -> io::Result<()> {
    let mut payload = serde_json::to_vec(response).map_err(io::Error::other)?;
    payload.push(b'\n');
    stream.write_all(&payload)?;
    stream.flush()
}
