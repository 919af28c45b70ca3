//! Versioned channel store records
//!
//! A record is the postcard encoding of `{ format_version, state }`. The
//! version is decoded on its own first so records from an unknown format are
//! reported instead of misparsed.

use serde::{Deserialize, Serialize};

use crate::channel::state::ChannelState;
use crate::errors::{Result, StoreError};

/// Format version written by this build
pub const RECORD_FORMAT_VERSION: u16 = 2;

/// Durable wrapper around one channel state
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelStoreRecord {
    /// Layout version of `state`
    pub format_version: u16,
    /// The channel state
    pub state: ChannelState,
}

/// Whole-store snapshot handed to a surrounding persistence system
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct StoreSnapshot {
    format_version: u16,
    states: Vec<ChannelState>,
}

fn encoding_error(err: postcard::Error) -> StoreError { StoreError::Encoding(err.to_string()) }

fn check_version(bytes: &[u8]) -> Result<()> {
    let (format_version, _) = postcard::take_from_bytes::<u16>(bytes).map_err(encoding_error)?;
    if format_version != RECORD_FORMAT_VERSION {
        return Err(StoreError::UnsupportedFormat(format_version).into());
    }
    Ok(())
}

/// Encodes `state` as a current-format record
pub fn encode_record(state: &ChannelState) -> Result<Vec<u8>> {
    let record = ChannelStoreRecord { format_version: RECORD_FORMAT_VERSION, state: state.clone() };
    Ok(postcard::to_allocvec(&record).map_err(encoding_error)?)
}

/// Decodes a record written by [`encode_record`]
///
/// # Errors
/// * `StoreError::UnsupportedFormat` - If the record was written by another format version
/// * `StoreError::Encoding` - If the bytes are not a record
pub fn decode_record(bytes: &[u8]) -> Result<ChannelState> {
    check_version(bytes)?;
    let record: ChannelStoreRecord = postcard::from_bytes(bytes).map_err(encoding_error)?;
    Ok(record.state)
}

/// Encodes a snapshot of `states`
pub fn encode_snapshot(states: Vec<ChannelState>) -> Result<Vec<u8>> {
    let snapshot = StoreSnapshot { format_version: RECORD_FORMAT_VERSION, states };
    Ok(postcard::to_allocvec(&snapshot).map_err(encoding_error)?)
}

/// Decodes a snapshot written by [`encode_snapshot`]
pub fn decode_snapshot(bytes: &[u8]) -> Result<Vec<ChannelState>> {
    check_version(bytes)?;
    let snapshot: StoreSnapshot = postcard::from_bytes(bytes).map_err(encoding_error)?;
    Ok(snapshot.states)
}
