// Copyright © 2025 Lukas Bower
// SPDX-License-Identifier: Apache-2.0
// Purpose: Fuzz-style regression tests for FCP message framing.
// Author: Lukas Bower
#![forbid(unsafe_code)]

use std::io::Cursor;
use std::panic::{catch_unwind, AssertUnwindSafe};

use fcp_wire::{write_message, BulkData, FieldSet, MessageReader, RawMessage};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

#[test]
fn mutated_streams_never_panic() {
    let iterations = std::env::var("FCP_FUZZ_ITERS")
        .ok()
        .and_then(|value| value.parse().ok())
        .unwrap_or(512);
    let mut rng = StdRng::seed_from_u64(0xFC9_F00D_u64);

    for _ in 0..iterations {
        let mut bytes = Vec::new();
        write_message(&mut bytes, &random_message(&mut rng)).unwrap();
        mutate(&mut rng, &mut bytes);
        let result = catch_unwind(AssertUnwindSafe(|| {
            let mut reader = MessageReader::with_limits(Cursor::new(bytes), 256, 4096);
            while let Ok(Some(_)) = reader.read_message() {}
        }));
        assert!(result.is_ok(), "decoder panicked on mutated stream");
    }
}

#[test]
fn unmutated_streams_decode_to_the_same_message() {
    let mut rng = StdRng::seed_from_u64(7);
    for _ in 0..128 {
        let message = random_message(&mut rng);
        let mut bytes = Vec::new();
        write_message(&mut bytes, &message).unwrap();
        let mut reader = MessageReader::new(Cursor::new(bytes));
        let decoded = reader.read_message().unwrap().expect("one message");
        assert_eq!(decoded.name, message.name);
        assert_eq!(decoded.data, message.data);
        for line in message.fields.lines() {
            let (key, value) = line.split_once('=').unwrap();
            assert_eq!(decoded.fields.get(key), Some(value));
        }
    }
}

fn random_message<R: Rng>(rng: &mut R) -> RawMessage {
    let names = ["ClientGet", "ClientPut", "SubscribeUSK", "AllData", "Void"];
    let name = names[rng.random_range(0..names.len())];
    let mut fields = FieldSet::new();
    for index in 0..rng.random_range(0..6) {
        let key = if rng.random_bool(0.3) {
            format!("Sub{}.Key{index}", rng.random_range(0..3))
        } else {
            format!("Key{index}")
        };
        fields.put_num(&key, rng.random::<i64>()).unwrap();
    }
    if rng.random_bool(0.5) {
        let len = rng.random_range(0..64);
        let data: Vec<u8> = (0..len).map(|_| rng.random()).collect();
        RawMessage::with_data(name, fields, BulkData::Owned(data))
    } else {
        RawMessage::new(name, fields)
    }
}

fn mutate<R: Rng>(rng: &mut R, bytes: &mut Vec<u8>) {
    if bytes.is_empty() {
        return;
    }
    match rng.random_range(0..4) {
        0 => {
            let at = rng.random_range(0..bytes.len());
            bytes[at] ^= rng.random_range(1..=0xFF);
        }
        1 => {
            let new_len = rng.random_range(0..bytes.len());
            bytes.truncate(new_len);
        }
        2 => {
            let tail_len = rng.random_range(1..32);
            bytes.extend((0..tail_len).map(|_| rng.random::<u8>()));
        }
        _ => {
            let text = String::from_utf8_lossy(bytes).replace("DataLength=", "DataLength=-");
            *bytes = text.into_bytes();
        }
    }
}
