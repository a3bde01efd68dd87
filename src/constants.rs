// This file is part of stratumdb.
//
// Copyright (C) 2025 Matheus Cardoso <varvedb@matheus.sbs>
//
// This Source Code Form is subject to the terms of the Mozilla Public License
// v. 2.0. If a copy of the MPL was not distributed with this file, You can
// obtain one at http://mozilla.org/MPL/2.0/.

use std::time::Duration;

/// Fixed size of a record's leading size field, key, CRC, and trailing size field.
/// `12 = 2 (leading size) + 4 (key) + 4 (crc32) + 2 (trailing size)`.
pub const RECORD_OVERHEAD: usize = 12;

/// Payload bytes must be a multiple of this word size; the on-wire size fields count words,
/// not bytes.
pub const PAYLOAD_WORD_SIZE: usize = 8;

/// Largest `payload_size_div8` representable in the 16-bit size field.
pub const MAX_PAYLOAD_WORDS: usize = u16::MAX as usize;

/// Payload length must be strictly less than this (512 KiB).
pub const MAX_PAYLOAD_SIZE: usize = 512 * 1024;

/// Largest possible on-wire record size, used to size tail reads for `get_last_sequence`.
pub const MAX_EVENT_FOOTPRINT: usize = RECORD_OVERHEAD + PAYLOAD_WORD_SIZE * MAX_PAYLOAD_WORDS;

/// Number of `append_transactional` calls a single shard accepts before it reports
/// `MaxReached` and the multi-blob driver must roll to the next shard.
pub const SHARD_APPEND_CAP: u32 = 50_000;

/// Threshold (and unit) for parallel sub-range reads in the multi-blob driver: a read whose
/// size is at least `2 * SLICE_SIZE` is split into `SLICE_SIZE`-sized parallel downloads plus
/// one short tail download.
pub const SLICE_SIZE: usize = 512 * 1024;

/// Slab size used when streaming a shard's bytes into a new compacted block blob.
pub const COMPACTION_SLAB_SIZE: usize = 4 * 1024 * 1024;

/// Append blob metadata key caching a shard's first event sequence.
pub const FIRST_KEY_METADATA: &str = "FirstKey";

/// Blob name prefix shared by every shard (`events.00000`, `events.00001`, ...).
pub const SHARD_NAME_PREFIX: &str = "events.";

/// Suffix marking a shard's compacted block-blob counterpart.
pub const COMPACT_SUFFIX: &str = ".compact";

/// Default local file backing the file/memory development drivers.
pub const STREAM_FILE_NAME: &str = "stream.bin";

/// Maximum retry attempts for an idempotent backend call (listing, reading, metadata).
pub const RETRY_MAX_ATTEMPTS: u32 = 5;

/// Per-attempt timeout on the first attempt of a call expected to be short (metadata, listing).
pub const RETRY_SHORT_TIMEOUT: Duration = Duration::from_secs(3);

/// Per-attempt timeout on every other attempt, and on calls not expected to be short.
pub const RETRY_LONG_TIMEOUT: Duration = Duration::from_secs(60);

/// Default interval between the facade's periodic wake-ups.
pub const DEFAULT_WAKE_INTERVAL: Duration = Duration::from_secs(30);

/// Default number of applied events between `upkeep_or_save_load` opportunities during the
/// initial catch-up.
pub const DEFAULT_EVENTS_BETWEEN_UPKEEP: u32 = 1_000;

/// Default bounded capacity of the quarantine bag; oldest entries are dropped past this cap.
pub const DEFAULT_QUARANTINE_CAPACITY: usize = 10_000;

/// Initial retry delay for the facade's bounded-exponential re-initialization backoff.
pub const FACADE_RETRY_BASE_DELAY: Duration = Duration::from_secs(5);

/// Mailbox capacity for the service facade.
pub const DEFAULT_MAILBOX_CAPACITY: usize = 256;

/// Returns true iff `name` matches `[-a-zA-Z0-9_]{1,16}`, the projection-name grammar from
/// the user-projection contract. Hand-rolled rather than pulling in a regex engine for one
/// fixed, tiny grammar.
pub fn is_valid_projection_name(name: &str) -> bool {
    let len = name.len();
    if len == 0 || len > 16 {
        return false;
    }
    name.bytes()
        .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_')
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn projection_name_grammar() {
        assert!(is_valid_projection_name("a"));
        assert!(is_valid_projection_name("order-totals_v2"));
        assert!(is_valid_projection_name(&"a".repeat(16)));
        assert!(!is_valid_projection_name(""));
        assert!(!is_valid_projection_name(&"a".repeat(17)));
        assert!(!is_valid_projection_name("has space"));
        assert!(!is_valid_projection_name("slash/name"));
    }

    #[test]
    fn footprint_matches_overhead_plus_max_payload() {
        assert_eq!(MAX_EVENT_FOOTPRINT, 12 + 8 * 65535);
    }
}
