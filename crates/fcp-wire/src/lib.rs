// Copyright © 2025 Lukas Bower
// SPDX-License-Identifier: Apache-2.0
// Purpose: Provide the FCP field-set model and line-oriented wire codec.
// Author: Lukas Bower
#![forbid(unsafe_code)]
#![warn(missing_docs)]

//! Field-set model, bulk payloads and the line-oriented wire codec shared by
//! the FCP node and its test tooling.
//!
//! A message on the wire is a name line, `Key=Value` lines, a terminator
//! (`EndMessage` or `Data`) and, after `Data`, exactly `DataLength` raw bytes.

mod bulk;
mod codec;
mod fieldset;

pub use bulk::{BulkData, BulkSource, SectionChain};
pub use codec::{
    write_message, CodecError, MessageReader, RawMessage, DATA_LENGTH, DATA_MARKER, END_MARKER,
    END_MESSAGE_MARKER, MAX_DATA_LEN, MAX_LINE_LEN,
};
pub use fieldset::{FieldSet, FieldSetError, MULTI_LEVEL_CHAR, MULTI_VALUE_CHAR};
