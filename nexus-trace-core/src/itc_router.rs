//! ITC (Instrumentation Trace Channel) demultiplexing: routes
//! `AuxAccessWrite`/`DataAcquisition` messages to per-channel text buffers
//! and flushes them into [`DecodedEvent::ItcPrint`]s.
//!
//! A target writes ASCII bytes to a fixed ITC channel (by software
//! convention, channel 0) to get them into the trace as `printf`-style
//! output. How eagerly to flush is configurable: don't treat ITC writes
//! as text at all, split on line breaks as they arrive, or buffer a
//! channel whole and flush it only on demand.

use std::collections::BTreeMap;

use crate::message::ItcWidth;
use crate::sink::DecodedEvent;

/// How ITC channel writes should be turned into text output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ItcPrintOpts {
    /// ITC writes are not treated as text; [`ItcRouter`] still tracks them
    /// for [`ItcRouter::flush_mask`] but never emits `ItcPrint` events.
    #[default]
    None,
    /// Emit one `ItcPrint` event per line, splitting on `\n`.
    Print,
    /// Never split: buffer a channel whole, emit it only when
    /// [`ItcRouter::flush_channel`]/[`ItcRouter::flush_all`] is called.
    Nls,
}

#[derive(Default)]
pub struct ItcRouter {
    opts: ItcPrintOpts,
    /// Channels treated as print streams. Defaults to channel 0, the
    /// conventional stdout channel.
    print_channels: u32,
    buffers: BTreeMap<(u8, u32), Vec<u8>>,
}

fn width_bytes(width: ItcWidth) -> usize {
    match width {
        ItcWidth::W32 => 4,
        ItcWidth::W16 => 2,
        ItcWidth::W8 => 1,
    }
}

impl ItcRouter {
    pub fn new(opts: ItcPrintOpts) -> Self {
        ItcRouter {
            opts,
            print_channels: 1, // channel 0
            buffers: BTreeMap::new(),
        }
    }

    pub fn with_print_channel_mask(opts: ItcPrintOpts, mask: u32) -> Self {
        ItcRouter {
            opts,
            print_channels: mask,
            buffers: BTreeMap::new(),
        }
    }

    fn is_print_channel(&self, channel: u32) -> bool {
        self.opts != ItcPrintOpts::None && (self.print_channels & (1 << channel.min(31))) != 0
    }

    /// Routes one ITC write, returning any events it produced immediately.
    pub fn handle_write(
        &mut self,
        core: u8,
        channel: u32,
        width: ItcWidth,
        data: u64,
    ) -> Vec<DecodedEvent> {
        if !self.is_print_channel(channel) {
            return Vec::new();
        }
        let n = width_bytes(width);
        let bytes = data.to_le_bytes();
        let buf = self.buffers.entry((core, channel)).or_default();
        buf.extend_from_slice(&bytes[..n]);

        if self.opts != ItcPrintOpts::Print {
            return Vec::new();
        }
        self.split_complete_lines(core, channel)
    }

    fn split_complete_lines(&mut self, core: u8, channel: u32) -> Vec<DecodedEvent> {
        let mut events = Vec::new();
        let buf = self.buffers.entry((core, channel)).or_default();
        while let Some(pos) = buf.iter().position(|&b| b == b'\n') {
            let line: Vec<u8> = buf.drain(..=pos).collect();
            events.push(DecodedEvent::ItcPrint {
                core,
                channel,
                text: line,
            });
        }
        events
    }

    /// Flushes one channel's buffered bytes regardless of line completion,
    /// e.g. at end of trace.
    pub fn flush_channel(&mut self, core: u8, channel: u32) -> Option<DecodedEvent> {
        let buf = self.buffers.remove(&(core, channel))?;
        if buf.is_empty() {
            return None;
        }
        Some(DecodedEvent::ItcPrint {
            core,
            channel,
            text: buf,
        })
    }

    pub fn flush_all(&mut self) -> Vec<DecodedEvent> {
        let keys: Vec<_> = self.buffers.keys().copied().collect();
        keys.into_iter()
            .filter_map(|(core, channel)| self.flush_channel(core, channel))
            .collect()
    }

    /// Bitmask (bit per channel, 0..32) of channels with unflushed bytes.
    pub fn flush_mask(&self, core: u8) -> u32 {
        self.buffers
            .keys()
            .filter(|(c, _)| *c == core)
            .fold(0u32, |mask, (_, channel)| {
                mask | (1 << (*channel).min(31))
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn print_mode_splits_on_newline() {
        let mut router = ItcRouter::new(ItcPrintOpts::Print);
        let events = router.handle_write(0, 0, ItcWidth::W32, u32::from_le_bytes(*b"hi\n!") as u64);
        assert_eq!(events.len(), 1);
        match &events[0] {
            DecodedEvent::ItcPrint { text, .. } => assert_eq!(text, b"hi\n"),
            _ => panic!(),
        }
        // the trailing '!' stays buffered
        assert_eq!(router.flush_mask(0), 0b1);
    }

    #[test]
    fn nls_mode_never_splits_until_flushed() {
        let mut router = ItcRouter::new(ItcPrintOpts::Nls);
        let events = router.handle_write(0, 0, ItcWidth::W32, u32::from_le_bytes(*b"hi\n!") as u64);
        assert!(events.is_empty());
        let flushed = router.flush_channel(0, 0).unwrap();
        match flushed {
            DecodedEvent::ItcPrint { text, .. } => assert_eq!(text, b"hi\n!"),
            _ => panic!(),
        }
    }

    #[test]
    fn none_mode_ignores_writes() {
        let mut router = ItcRouter::new(ItcPrintOpts::None);
        let events = router.handle_write(0, 0, ItcWidth::W8, b'x' as u64);
        assert!(events.is_empty());
        assert_eq!(router.flush_mask(0), 0);
    }

    #[test]
    fn non_print_channel_is_ignored() {
        let mut router = ItcRouter::new(ItcPrintOpts::Print);
        let events = router.handle_write(0, 5, ItcWidth::W8, b'x' as u64);
        assert!(events.is_empty());
    }
}
