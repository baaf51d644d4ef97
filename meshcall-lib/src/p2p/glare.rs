use crate::media::SignalingState;

/// What to do with an offer arriving from a peer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum OfferDisposition {
    /// No offer of ours is in flight.
    Accept,
    /// Both sides offered; ours loses. Rebuild the connection and answer theirs.
    Yield,
    /// Both sides offered; ours wins. The peer will answer it.
    Ignore,
}

/// Settles simultaneous offers by comparing client ids, so both sides agree without a round trip.
pub(crate) fn resolve_offer(
    local_id: &str,
    remote_id: &str,
    state: Option<SignalingState>,
) -> OfferDisposition {
    if state != Some(SignalingState::HaveLocalOffer) {
        return OfferDisposition::Accept;
    }
    if local_id > remote_id {
        OfferDisposition::Yield
    } else {
        OfferDisposition::Ignore
    }
}
