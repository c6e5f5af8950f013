//! Splitting the camera's byte stream back into frames
//!
//! `rpicam-vid` writes frames back to back on one pipe and reads return
//! arbitrary slices of that stream. A [`Framer`] buffers what it has read
//! and only hands out whole frames, so one request is one frame.

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt};
use tracing::debug;

use super::h264::{NAL_AUD, NAL_IDR, NAL_SEI, NAL_SLICE};
use crate::config::{Codec, Options};

/// Minimum free space reserved before each read.
const READ_SIZE: usize = 65536;

/// JPEG end-of-image marker
const JPEG_EOI: [u8; 2] = [0xFF, 0xD9];

/// How frame boundaries are found in a stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Framing {
    /// Raw frames of a fixed size
    Raw(usize),
    /// H.264 Annex B, one access unit per frame
    H264,
    /// Concatenated JPEGs, each ending at an EOI marker
    Mjpeg,
    /// No boundaries known; every read is passed on
    Chunked,
}

impl Framing {
    pub fn for_options(options: &Options) -> Self {
        match (options.codec, options.raw_frame_len()) {
            (_, Some(len)) => Framing::Raw(len),
            (Codec::H264, None) => Framing::H264,
            (Codec::Mjpeg, None) => Framing::Mjpeg,
            _ => Framing::Chunked,
        }
    }

    /// Whether each buffer produced is exactly one frame.
    pub fn is_frame_delimited(&self) -> bool {
        !matches!(self, Framing::Chunked)
    }
}

/// Buffers stream data and cuts it at frame boundaries.
#[derive(Debug)]
pub struct Framer {
    framing: Framing,
    pending: BytesMut,
    /// Bytes of `pending` already searched for a boundary
    scanned: usize,
    /// The H.264 access unit being assembled already holds a slice
    has_slice: bool,
}

impl Framer {
    pub fn new(framing: Framing) -> Self {
        Self {
            framing,
            pending: BytesMut::new(),
            scanned: 0,
            has_slice: false,
        }
    }

    /// Next whole frame, reading from `reader` as needed.
    ///
    /// `Ok(None)` at end of stream. A trailing partial raw frame is
    /// discarded; for compressed streams the remainder is the last frame.
    pub async fn next_frame<R: AsyncRead + Unpin>(
        &mut self,
        reader: &mut R,
    ) -> std::io::Result<Option<Bytes>> {
        loop {
            if let Some(frame) = self.split() {
                return Ok(Some(frame));
            }
            self.pending.reserve(READ_SIZE);
            if reader.read_buf(&mut self.pending).await? == 0 {
                return Ok(self.finish());
            }
        }
    }

    fn split(&mut self) -> Option<Bytes> {
        match self.framing {
            Framing::Raw(len) => (self.pending.len() >= len).then(|| self.take(len)),
            Framing::Chunked => (!self.pending.is_empty()).then(|| self.take(self.pending.len())),
            Framing::Mjpeg => self.split_jpeg(),
            Framing::H264 => self.split_access_unit(),
        }
    }

    fn take(&mut self, len: usize) -> Bytes {
        self.scanned = 0;
        self.pending.split_to(len).freeze()
    }

    fn finish(&mut self) -> Option<Bytes> {
        self.has_slice = false;
        if self.pending.is_empty() {
            return None;
        }
        if let Framing::Raw(len) = self.framing {
            debug!(
                "Discarding partial frame: {} of {} bytes",
                self.pending.len(),
                len
            );
            self.pending.clear();
            self.scanned = 0;
            return None;
        }
        Some(self.take(self.pending.len()))
    }

    fn split_jpeg(&mut self) -> Option<Bytes> {
        // Back up one byte in case the marker straddled two reads.
        let from = self.scanned.saturating_sub(1);
        match self.pending[from..].windows(2).position(|w| w == JPEG_EOI) {
            Some(at) => Some(self.take(from + at + 2)),
            None => {
                self.scanned = self.pending.len();
                None
            }
        }
    }

    /// Cut before the first NAL unit that opens a new access unit.
    ///
    /// Once a slice has been seen, an AUD, SEI, SPS or PPS starts the next
    /// access unit, and so does a slice whose `first_mb_in_slice` is 0.
    fn split_access_unit(&mut self) -> Option<Bytes> {
        let buf = &self.pending;
        let mut i = self.scanned;
        while i + 3 < buf.len() {
            if buf[i] != 0 || buf[i + 1] != 0 || buf[i + 2] != 1 {
                i += 1;
                continue;
            }
            let nal = buf[i + 3] & 0x1F;
            let is_slice = nal == NAL_SLICE || nal == NAL_IDR;
            if is_slice && i + 4 >= buf.len() {
                // Slice header not read yet
                break;
            }
            // first_mb_in_slice is ue(v): a leading 1 bit encodes 0
            let opens_unit = self.has_slice
                && ((NAL_SEI..=NAL_AUD).contains(&nal) || (is_slice && buf[i + 4] & 0x80 != 0));
            if opens_unit {
                // A 4-byte start code's leading zero belongs to the next unit
                let cut = if buf[i - 1] == 0 { i - 1 } else { i };
                let unit = self.pending.split_to(cut).freeze();
                self.scanned = i - cut;
                self.has_slice = false;
                return Some(unit);
            }
            if is_slice {
                self.has_slice = true;
            }
            i += 3;
        }
        self.scanned = i;
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt;

    const SPS: [u8; 8] = [0x00, 0x00, 0x00, 0x01, 0x67, 0x42, 0x00, 0x1E];
    const PPS: [u8; 7] = [0x00, 0x00, 0x00, 0x01, 0x68, 0xCE, 0x38];
    const IDR_HEADER: [u8; 6] = [0x00, 0x00, 0x00, 0x01, 0x65, 0x88];
    const P_SLICE: [u8; 7] = [0x00, 0x00, 0x00, 0x01, 0x41, 0x9A, 0x24];

    /// A large IDR access unit with parameter sets, as `rpicam-vid --inline` emits.
    fn idr_unit(payload: usize) -> Vec<u8> {
        let mut unit = [&SPS[..], &PPS[..], &IDR_HEADER[..]].concat();
        unit.resize(unit.len() + payload, 0xAB);
        unit
    }

    fn jpeg(payload: usize) -> Vec<u8> {
        let mut frame = vec![0xFF, 0xD8];
        frame.resize(2 + payload, 0xAB);
        frame.extend_from_slice(&JPEG_EOI);
        frame
    }

    /// Collect every frame from `data`, delivered in reads of at most 1 KiB.
    async fn frames(framing: Framing, data: Vec<u8>) -> Vec<Bytes> {
        let (mut writer, mut reader) = tokio::io::duplex(1024);
        let feed = tokio::spawn(async move {
            writer.write_all(&data).await.unwrap();
        });

        let mut framer = Framer::new(framing);
        let mut out = Vec::new();
        while let Some(frame) = framer.next_frame(&mut reader).await.unwrap() {
            out.push(frame);
        }
        feed.await.unwrap();
        out
    }

    #[tokio::test]
    async fn multi_read_access_unit_is_one_frame() {
        let idr = idr_unit(150_000);
        let stream = [&idr[..], &P_SLICE[..]].concat();

        let out = frames(Framing::H264, stream).await;
        assert_eq!(out.len(), 2);
        assert_eq!(&out[0][..], &idr[..]);
        assert_eq!(&out[1][..], &P_SLICE[..]);
    }

    #[tokio::test]
    async fn parameter_sets_stay_with_their_keyframe() {
        let first = idr_unit(4000);
        let second = idr_unit(4000);
        let stream = [&P_SLICE[..], &first[..], &second[..]].concat();

        let out = frames(Framing::H264, stream).await;
        assert_eq!(out.len(), 3);
        assert_eq!(&out[0][..], &P_SLICE[..]);
        assert_eq!(&out[1][..], &first[..]);
        assert!(crate::capture::h264::contains_sps(&out[1]));
        assert!(crate::capture::h264::contains_keyframe(&out[1]));
    }

    #[test]
    fn later_slices_of_a_picture_stay_together() {
        // Second slice has first_mb_in_slice != 0 (leading bit clear)
        let second_slice = [0x00, 0x00, 0x01, 0x41, 0x40, 0x11];
        let mut framer = Framer::new(Framing::H264);
        framer.pending.extend_from_slice(&P_SLICE);
        framer.pending.extend_from_slice(&second_slice);
        assert_eq!(framer.split(), None);

        framer.pending.extend_from_slice(&P_SLICE);
        let unit = framer.split().unwrap();
        assert_eq!(&unit[..], &[&P_SLICE[..], &second_slice[..]].concat()[..]);
    }

    #[test]
    fn start_code_split_across_reads() {
        let mut framer = Framer::new(Framing::H264);
        framer.pending.extend_from_slice(&P_SLICE);
        framer.pending.extend_from_slice(&[0x00, 0x00]);
        assert_eq!(framer.split(), None);

        framer.pending.extend_from_slice(&[0x00, 0x01, 0x41]);
        assert_eq!(framer.split(), None);
        framer.pending.extend_from_slice(&[0x9A]);
        assert_eq!(&framer.split().unwrap()[..], &P_SLICE[..]);
    }

    #[tokio::test]
    async fn multi_read_jpeg_is_one_frame() {
        let big = jpeg(150_000);
        let small = jpeg(10);
        let out = frames(Framing::Mjpeg, [&big[..], &small[..]].concat()).await;
        assert_eq!(out.len(), 2);
        assert_eq!(&out[0][..], &big[..]);
        assert_eq!(&out[1][..], &small[..]);
    }

    #[test]
    fn jpeg_marker_split_across_reads() {
        let mut framer = Framer::new(Framing::Mjpeg);
        framer.pending.extend_from_slice(&[0xFF, 0xD8, 0x01, 0xFF]);
        assert_eq!(framer.split(), None);
        framer.pending.extend_from_slice(&[0xD9, 0xFF, 0xD8]);
        assert_eq!(&framer.split().unwrap()[..], &[0xFF, 0xD8, 0x01, 0xFF, 0xD9]);
        assert_eq!(&framer.pending[..], &[0xFF, 0xD8]);
    }

    #[tokio::test]
    async fn raw_frames_drop_trailing_partial() {
        let out = frames(Framing::Raw(3000), vec![1u8; 7000]).await;
        assert_eq!(out.len(), 2);
        assert!(out.iter().all(|f| f.len() == 3000));
    }

    #[test]
    fn framing_follows_codec() {
        let opts = |codec| Options {
            codec,
            ..Default::default()
        };
        assert!(matches!(Framing::for_options(&opts(Codec::Yuv420)), Framing::Raw(_)));
        assert_eq!(Framing::for_options(&opts(Codec::H264)), Framing::H264);
        assert_eq!(Framing::for_options(&opts(Codec::Mjpeg)), Framing::Mjpeg);
        assert_eq!(Framing::for_options(&opts(Codec::Libav)), Framing::Chunked);
        assert!(!Framing::Chunked.is_frame_delimited());
    }
}
