// SPDX-License-Identifier: PMPL-1.0-or-later
// Fuzz target for the on-disk header, descriptor and commit decoders
// Copyright (c) 2026 Keel contributors

#![no_main]

use keel_journal::layout::{self, BlockKind, CommitRecord, Descriptor, JournalHeader};
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    // Decoders must reject garbage without panicking.
    let header = JournalHeader::decode(data);
    let descriptor = Descriptor::decode(data);
    let commit = CommitRecord::decode(data);

    match layout::peek_kind(data) {
        BlockKind::Header => {}
        BlockKind::Descriptor => assert!(header.is_err() && commit.is_err()),
        BlockKind::Commit => assert!(header.is_err() && descriptor.is_err()),
        BlockKind::Other => {
            assert!(header.is_err() && descriptor.is_err() && commit.is_err())
        }
    }

    // Anything that decodes survives a re-encode.
    if let Ok(header) = header {
        assert_eq!(JournalHeader::decode(&header.encode(data.len())).ok(), Some(header));
    }
    if let (Ok(descriptor), Ok(commit)) = (descriptor, commit) {
        let _ = layout::pair_addresses(&descriptor, &commit);
    }
});
