//! Just enough H.264 Annex B scanning to find where a recording may start

/// Non-IDR slice NAL unit type
pub(crate) const NAL_SLICE: u8 = 1;
/// IDR slice NAL unit type
pub(crate) const NAL_IDR: u8 = 5;
/// SEI NAL unit type
pub(crate) const NAL_SEI: u8 = 6;
/// Sequence parameter set NAL unit type
pub(crate) const NAL_SPS: u8 = 7;
/// Access unit delimiter NAL unit type
pub(crate) const NAL_AUD: u8 = 9;

/// NAL unit types of every start-code-prefixed unit in `data`.
///
/// Both 3-byte (`00 00 01`) and 4-byte (`00 00 00 01`) start codes are
/// recognised; the 4-byte form is a 3-byte code preceded by a zero.
pub fn nal_types(data: &[u8]) -> impl Iterator<Item = u8> + '_ {
    data.windows(4)
        .filter(|w| w[0] == 0 && w[1] == 0 && w[2] == 1)
        .map(|w| w[3] & 0x1F)
}

/// Whether the chunk contains an IDR slice.
pub fn contains_keyframe(data: &[u8]) -> bool {
    nal_types(data).any(|t| t == NAL_IDR)
}

/// Whether the chunk carries a sequence parameter set.
pub fn contains_sps(data: &[u8]) -> bool {
    nal_types(data).any(|t| t == NAL_SPS)
}

#[cfg(test)]
mod tests {
    use super::*;

    const SPS: [u8; 8] = [0x00, 0x00, 0x00, 0x01, 0x67, 0x42, 0x00, 0x1E];
    const PPS: [u8; 7] = [0x00, 0x00, 0x01, 0x68, 0xCE, 0x38, 0x80];
    const IDR: [u8; 7] = [0x00, 0x00, 0x00, 0x01, 0x65, 0x88, 0x84];
    const P_SLICE: [u8; 7] = [0x00, 0x00, 0x00, 0x01, 0x41, 0x9A, 0x24];

    #[test]
    fn finds_each_unit_type() {
        let stream = [&SPS[..], &PPS[..], &IDR[..]].concat();
        assert_eq!(nal_types(&stream).collect::<Vec<_>>(), vec![7, 8, 5]);
        assert!(contains_keyframe(&stream));
        assert!(contains_sps(&stream));
    }

    #[test]
    fn p_slices_are_not_keyframes() {
        assert!(!contains_keyframe(&P_SLICE));
        assert!(!contains_keyframe(&SPS));
        assert!(!contains_sps(&P_SLICE));
    }

    #[test]
    fn short_or_empty_chunks() {
        assert!(!contains_keyframe(&[]));
        assert!(!contains_keyframe(&[0x00, 0x00, 0x01]));
        assert!(contains_keyframe(&[0x00, 0x00, 0x01, 0x65]));
    }
}
