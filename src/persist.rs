// Copyright © 2025 Lukas Bower
// SPDX-License-Identifier: Apache-2.0
// Purpose: Durable store for forever-persisted client requests.
// Author: Lukas Bower

//! Durable request store.
//!
//! The store file is `i64 magic | i32 count | (u32 len | record)*`, where each
//! record is the detail form produced by [`encode_request`]. Writes go to a
//! sibling temporary file that is renamed over the store, so a crash leaves
//! either the old or the new checkpoint. A record that fails to decode is
//! skipped on load; a bad file header fails the whole load.

use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use log::{debug, error, info, warn};
use thiserror::Error;

use crate::binary::{self, BinaryError, Cursor};
use crate::identifier::{IdentifierCodecError, RequestIdentifier};
use crate::registry::ClientRegistry;
use crate::request::{ClientRequest, Persistence, RequestEngine, RequestState};

/// Leading magic of one request record.
pub const REQUEST_MAGIC: i64 = 0xebf0_b4f4_fa9f_6721_u64 as i64;
/// Request record layout version.
pub const REQUEST_VERSION: i32 = 1;
/// Leading magic of the store file.
pub const STORE_MAGIC: i64 = 0x4663_7053_746f_7265;

/// Failures reading or writing the store.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store i/o: {0}")]
    Io(#[from] io::Error),
    #[error("bad store magic {0:#x}")]
    BadStoreMagic(i64),
    #[error("bad request record magic {0:#x}")]
    BadRecordMagic(i64),
    #[error("unsupported request record version {0}")]
    BadRecordVersion(i32),
    #[error("request identifier: {0}")]
    Identifier(#[from] IdentifierCodecError),
    #[error("corrupt record: {0}")]
    Corrupt(String),
    #[error("{0} is not a forever request")]
    NotForever(String),
}

impl From<BinaryError> for StoreError {
    fn from(err: BinaryError) -> Self {
        Self::Corrupt(err.to_string())
    }
}

/// Encode the detail record of a forever request.
pub fn encode_request(request: &ClientRequest) -> Result<Vec<u8>, StoreError> {
    if request.persistence() != Persistence::Forever {
        return Err(StoreError::NotForever(request.identifier().to_string()));
    }
    let mut out = Vec::with_capacity(64 + request.uri().len());
    out.extend_from_slice(&REQUEST_MAGIC.to_be_bytes());
    out.extend_from_slice(&REQUEST_VERSION.to_be_bytes());
    request.identifier().write_to(&mut out)?;
    out.extend_from_slice(&request.verbosity().to_be_bytes());
    out.extend_from_slice(&request.started_at_millis().to_be_bytes());
    out.extend_from_slice(&request.priority_class().to_be_bytes());
    match request.client_token() {
        Some(token) => {
            binary::put_bool(&mut out, true);
            binary::put_utf(&mut out, &token)?;
        }
        None => binary::put_bool(&mut out, false),
    }
    let state = request.state();
    binary::put_bool(
        &mut out,
        matches!(state, RequestState::Succeeded | RequestState::Failed),
    );
    binary::put_bool(&mut out, state == RequestState::Succeeded);
    binary::put_utf(&mut out, request.uri())?;
    Ok(out)
}

/// Decode one detail record. Unfinished requests come back queued.
pub fn decode_request(bytes: &[u8]) -> Result<ClientRequest, StoreError> {
    let mut cursor = Cursor::new(bytes);
    let magic = cursor.read_i64()?;
    if magic != REQUEST_MAGIC {
        return Err(StoreError::BadRecordMagic(magic));
    }
    let version = cursor.read_i32()?;
    if version != REQUEST_VERSION {
        return Err(StoreError::BadRecordVersion(version));
    }
    let id = RequestIdentifier::read_from(&mut cursor)?;
    let verbosity = cursor.read_i32()?;
    let started_at_millis = cursor.read_i64()?;
    let priority_class = cursor.read_i16()?;
    let client_token = if cursor.read_bool()? {
        Some(cursor.read_utf()?)
    } else {
        None
    };
    let finished = cursor.read_bool()?;
    let succeeded = cursor.read_bool()?;
    let uri = cursor.read_utf()?;
    if cursor.remaining() != 0 {
        return Err(StoreError::Corrupt(format!(
            "{} trailing bytes after {id}",
            cursor.remaining()
        )));
    }
    let state = match (finished, succeeded) {
        (false, _) => RequestState::Queued,
        (true, true) => RequestState::Succeeded,
        (true, false) => RequestState::Failed,
    };
    Ok(ClientRequest::restored(
        id,
        uri,
        verbosity,
        started_at_millis,
        priority_class,
        client_token,
        state,
    ))
}

/// Checkpoint file holding every forever request.
#[derive(Debug, Clone)]
pub struct FileRequestStore {
    path: PathBuf,
}

impl FileRequestStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Replace the store contents with `requests`.
    ///
    /// A request whose record cannot be encoded is logged and left out; the
    /// rest are still written.
    pub fn save(&self, requests: &[Arc<ClientRequest>]) -> Result<(), StoreError> {
        let mut out = Vec::new();
        out.extend_from_slice(&STORE_MAGIC.to_be_bytes());
        let mut records = Vec::with_capacity(requests.len());
        for request in requests {
            match encode_request(request) {
                Ok(record) if u32::try_from(record.len()).is_ok() => records.push(record),
                Ok(_) => warn!("not storing {}: record too large", request.identifier()),
                Err(err) => warn!("not storing {}: {err}", request.identifier()),
            }
        }
        let count = i32::try_from(records.len())
            .map_err(|_| StoreError::Corrupt("too many requests".to_owned()))?;
        out.extend_from_slice(&count.to_be_bytes());
        for record in &records {
            out.extend_from_slice(&(record.len() as u32).to_be_bytes());
            out.extend_from_slice(record);
        }
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        let tmp = self.path.with_extension("tmp");
        {
            let mut file = File::create(&tmp)?;
            file.write_all(&out)?;
            file.sync_all()?;
        }
        fs::rename(&tmp, &self.path)?;
        debug!(
            "checkpointed {} forever requests to {}",
            records.len(),
            self.path.display()
        );
        Ok(())
    }

    /// Read every decodable request. A missing file is an empty store.
    pub fn load(&self) -> Result<Vec<ClientRequest>, StoreError> {
        let bytes = match fs::read(&self.path) {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(err.into()),
        };
        let mut cursor = Cursor::new(&bytes);
        let magic = cursor.read_i64()?;
        if magic != STORE_MAGIC {
            return Err(StoreError::BadStoreMagic(magic));
        }
        let count = cursor.read_i32()?;
        let mut requests = Vec::with_capacity(usize::try_from(count).unwrap_or(0).min(4096));
        for index in 0..count {
            let len = cursor.read_u32()? as usize;
            let record = cursor.take(len)?;
            match decode_request(record) {
                Ok(request) => requests.push(request),
                Err(err) => warn!("skipping stored request {index}: {err}"),
            }
        }
        Ok(requests)
    }

    /// Write every forever request currently in `registry`.
    pub fn checkpoint(&self, registry: &ClientRegistry) -> Result<(), StoreError> {
        self.save(&registry.forever_requests())
    }
}

/// Reload the store into `registry` and restart unfinished requests.
///
/// Returns how many requests were resumed.
pub fn restore(
    store: &FileRequestStore,
    registry: &ClientRegistry,
    engine: &dyn RequestEngine,
) -> Result<usize, StoreError> {
    let mut resumed = 0;
    for request in store.load()? {
        let request = Arc::new(request);
        match registry.resume(Arc::clone(&request)) {
            Ok(_) => {
                resumed += 1;
                if !request.is_finished() {
                    engine.start(&request, None);
                }
            }
            Err(err) => error!("dropping restored request {}: {err}", request.identifier()),
        }
    }
    info!("restored {resumed} forever requests from {}", store.path().display());
    Ok(resumed)
}
