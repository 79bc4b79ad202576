// Copyright (C) 2021 Scott Lamb <slamb@slamb.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Bounded hex dumps for error and debug output.

use pretty_hex::PrettyHex;

/// A `Debug`-formattable hex dump of at most `max_bytes` of a buffer.
pub struct HexSnippet<'a> {
    data: &'a [u8],
    max_bytes: usize,
}

impl<'a> HexSnippet<'a> {
    pub fn new(data: &'a [u8], max_bytes: usize) -> Self {
        Self { data, max_bytes }
    }
}

impl<'a> std::fmt::Debug for HexSnippet<'a> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let shown = std::cmp::min(self.data.len(), self.max_bytes);
        writeln!(f, "Length: {0} (0x{0:x}) bytes", self.data.len())?;
        write!(
            f,
            "{:#?}",
            self.data[..shown].hex_conf(pretty_hex::HexConfig {
                title: false,
                ..Default::default()
            })
        )?;
        if shown < self.data.len() {
            write!(f, "\n...{} bytes not shown...", self.data.len() - shown)?;
        }
        Ok(())
    }
}
