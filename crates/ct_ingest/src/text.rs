// Copyright (c) 2025 Cloudflare, Inc.
// Licensed under the BSD-3-Clause license found in the LICENSE file or at https://opensource.org/licenses/BSD-3-Clause

use ct_entry::RawText;

/// Make certificate text safe for storage: invalid UTF-8 sequences become
/// U+FFFD and NUL characters are removed.
pub fn fix_utf8(text: &[u8]) -> String {
    let mut s = String::from_utf8_lossy(text).into_owned();
    s.retain(|c| c != '\0');
    s
}

/// [`fix_utf8`] each value and join them with `;`.
pub fn join_fixed(values: &[RawText]) -> String {
    values
        .iter()
        .map(|v| fix_utf8(v))
        .collect::<Vec<_>>()
        .join(";")
}
