// Copyright (c) 2025 Cloudflare, Inc.
// Licensed under the BSD-3-Clause license found in the LICENSE file or at https://opensource.org/licenses/BSD-3-Clause

#![no_main]

use ct_entry::{EntryDecoder, MerkleTreeLeaf, RawLeaf, Rfc6962Decoder};
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    // A leaf that parses must marshal back to the same bytes.
    if let Ok(leaf) = MerkleTreeLeaf::from_bytes(data) {
        assert_eq!(leaf.to_bytes().unwrap(), data);
    }

    let raw = RawLeaf {
        index: 0,
        leaf_input: data.to_vec(),
    };
    let _ = Rfc6962Decoder.decode(&raw);
});
