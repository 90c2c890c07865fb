//! Payload header validation
//!
//! [`validate`] is a pure function of the current header, the header history
//! and the stream configuration. Checks run in a fixed order and the first
//! match wins:
//!
//! 1. ERR bit set
//! 2. HLE outside 2..=12
//! 3. HLE inconsistent with the PTS/SCR flags
//! 4. Reserved bit set on a non-final payload
//! 5. FID/EOF/PTS cross-checks against the previous header
//!
//! Steps 1-4 only look at the current header. Step 5 needs history and only
//! runs once the current header's bits can be trusted.

use crate::config::StreamConfig;
use crate::error::UvcError;
use crate::header::{PayloadHeader, MAX_HEADER_LEN, MIN_HEADER_LEN};

/// The last two accepted headers.
///
/// Only headers that were accepted into a frame enter the history; rejected
/// payloads leave it untouched.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HeaderHistory {
    /// Most recent accepted header
    pub prev: PayloadHeader,
    /// The one before it
    pub prev_prev: PayloadHeader,
}

impl HeaderHistory {
    /// Push an accepted header.
    pub fn shift(&mut self, current: PayloadHeader) {
        self.prev_prev = self.prev;
        self.prev = current;
    }

    /// Forget all history.
    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

/// Classify `cur` against the accepted history.
pub fn validate(cur: &PayloadHeader, history: &HeaderHistory, _config: &StreamConfig) -> UvcError {
    if let Some(err) = check_local(cur) {
        return err;
    }
    check_sequence(cur, &history.prev)
}

/// Checks that need only the header itself.
fn check_local(cur: &PayloadHeader) -> Option<UvcError> {
    if cur.error() {
        return Some(UvcError::ErrBitSet);
    }

    if !(MIN_HEADER_LEN..=MAX_HEADER_LEN).contains(&cur.hle) {
        return Some(UvcError::LengthOutOfRange);
    }

    if cur.hle != cur.expected_len() {
        return Some(UvcError::LengthInvalid);
    }

    if !cur.eof() && cur.reserved() {
        return Some(UvcError::ReservedBitSet);
    }

    None
}

/// FID/EOF/PTS consistency with the previous accepted header.
fn check_sequence(cur: &PayloadHeader, prev: &PayloadHeader) -> UvcError {
    let same_fid = cur.fid() == prev.fid();

    if same_fid && prev.eof() {
        if cur.pts == prev.pts && cur.pts != 0 {
            return UvcError::Swap;
        }
        if prev.is_present() {
            return UvcError::FidMismatch;
        }
    }

    if !same_fid && !prev.eof() && prev.is_present() {
        return UvcError::MissingEof;
    }

    UvcError::NoError
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::header::{BFH_ERR, BFH_PTS, BFH_RES, BFH_SCR};
    use proptest::prelude::*;

    fn check(cur: PayloadHeader, prev: PayloadHeader) -> UvcError {
        let history = HeaderHistory {
            prev,
            prev_prev: PayloadHeader::default(),
        };
        validate(&cur, &history, &StreamConfig::default())
    }

    fn fresh(cur: PayloadHeader) -> UvcError {
        check(cur, PayloadHeader::default())
    }

    // ========================================================================
    // Header-local checks
    // ========================================================================

    #[test]
    fn test_correct_lengths_are_valid() {
        let base = PayloadHeader::new(false, false);
        assert_eq!(fresh(base), UvcError::NoError);
        assert_eq!(fresh(base.with_pts(1)), UvcError::NoError);
        assert_eq!(fresh(base.with_scr(1, 0)), UvcError::NoError);
        assert_eq!(fresh(base.with_pts(1).with_scr(1, 0)), UvcError::NoError);
    }

    #[test]
    fn test_off_by_one_lengths_are_invalid() {
        let base = PayloadHeader::new(false, false);
        for header in [
            base.with_pts(1),
            base.with_scr(1, 0),
            base.with_pts(1).with_scr(1, 0),
        ] {
            assert_eq!(fresh(header.with_len(header.hle - 1)), UvcError::LengthInvalid);
            if header.hle < MAX_HEADER_LEN {
                assert_eq!(fresh(header.with_len(header.hle + 1)), UvcError::LengthInvalid);
            }
        }
        // 2 + 1 is in range but wrong for no flags; 2 - 1 is out of range
        assert_eq!(fresh(base.with_len(3)), UvcError::LengthInvalid);
        assert_eq!(fresh(base.with_len(1)), UvcError::LengthOutOfRange);
        // 12 + 1 is out of range
        let full = base.with_pts(1).with_scr(1, 0);
        assert_eq!(fresh(full.with_len(13)), UvcError::LengthOutOfRange);
    }

    #[test]
    fn test_error_bit_wins_over_everything() {
        let header = PayloadHeader::new(false, false)
            .with_flags(BFH_ERR | BFH_RES)
            .with_len(0);
        assert_eq!(fresh(header), UvcError::ErrBitSet);
    }

    #[test]
    fn test_reserved_bit_only_matters_before_eof() {
        let mid = PayloadHeader::new(false, false).with_flags(BFH_RES);
        assert_eq!(fresh(mid), UvcError::ReservedBitSet);
        let last = PayloadHeader::new(false, true).with_flags(BFH_RES);
        assert_eq!(fresh(last), UvcError::NoError);
    }

    // ========================================================================
    // Sequence checks
    // ========================================================================

    #[test]
    fn test_swap_on_repeated_pts_after_eof() {
        let prev = PayloadHeader::new(true, true).with_pts(500);
        let cur = PayloadHeader::new(true, false).with_pts(500);
        assert_eq!(check(cur, prev), UvcError::Swap);
    }

    #[test]
    fn test_fid_mismatch_after_eof() {
        let prev = PayloadHeader::new(true, true).with_pts(500);
        let cur = PayloadHeader::new(true, false).with_pts(600);
        assert_eq!(check(cur, prev), UvcError::FidMismatch);

        // Zero PTS never counts as a swap
        let prev = PayloadHeader::new(false, true);
        let cur = PayloadHeader::new(false, false);
        assert_eq!(check(cur, prev), UvcError::FidMismatch);
    }

    #[test]
    fn test_missing_eof_on_toggle() {
        let prev = PayloadHeader::new(false, false);
        let cur = PayloadHeader::new(true, false);
        assert_eq!(check(cur, prev), UvcError::MissingEof);
    }

    #[test]
    fn test_clean_toggle_after_eof() {
        let prev = PayloadHeader::new(false, true);
        let cur = PayloadHeader::new(true, false);
        assert_eq!(check(cur, prev), UvcError::NoError);
    }

    #[test]
    fn test_first_payload_has_no_history() {
        assert_eq!(fresh(PayloadHeader::new(true, false)), UvcError::NoError);
        assert_eq!(fresh(PayloadHeader::new(false, false)), UvcError::NoError);
    }

    #[test]
    fn test_local_checks_precede_sequence_checks() {
        let prev = PayloadHeader::new(false, false);
        let cur = PayloadHeader::new(true, false).with_len(4);
        assert_eq!(check(cur, prev), UvcError::LengthInvalid);
    }

    #[test]
    fn test_history_shift() {
        let mut history = HeaderHistory::default();
        let a = PayloadHeader::new(false, false);
        let b = PayloadHeader::new(false, true);
        history.shift(a);
        history.shift(b);
        assert_eq!(history.prev, b);
        assert_eq!(history.prev_prev, a);
        history.reset();
        assert!(!history.prev.is_present());
    }

    proptest! {
        #[test]
        fn prop_out_of_range_lengths(
            hle in prop_oneof![Just(0u8), Just(1u8), 13u8..=255],
            bfh in any::<u8>(),
        ) {
            let header = PayloadHeader { hle, bfh: bfh & !BFH_ERR, pts: 0, scr: 0 };
            prop_assert_eq!(fresh(header), UvcError::LengthOutOfRange);
        }

        #[test]
        fn prop_consistent_headers_never_fail_locally(
            fid in any::<bool>(),
            eof in any::<bool>(),
            pts in proptest::option::of(1u32..=u32::MAX),
            stc in proptest::option::of(any::<u32>()),
        ) {
            let mut header = PayloadHeader::new(fid, eof);
            if let Some(pts) = pts {
                header = header.with_pts(pts);
            }
            if let Some(stc) = stc {
                header = header.with_scr(stc, 0);
            }
            prop_assert_eq!(header.hle, header.expected_len());
            prop_assert_eq!(fresh(header), UvcError::NoError);
        }

        #[test]
        fn prop_validator_never_returns_unknown(
            hle in any::<u8>(),
            bfh in any::<u8>(),
            pts in any::<u32>(),
            prev_bfh in any::<u8>(),
            prev_pts in any::<u32>(),
        ) {
            let cur = PayloadHeader { hle, bfh, pts, scr: 0 };
            let prev = PayloadHeader {
                hle: 2,
                bfh: prev_bfh & !(BFH_PTS | BFH_SCR),
                pts: prev_pts,
                scr: 0,
            };
            let verdict = check(cur, prev);
            prop_assert_ne!(verdict, UvcError::Unknown);
            prop_assert_ne!(verdict, UvcError::Empty);
            prop_assert_ne!(verdict, UvcError::PayloadOverflow);
        }
    }
}
