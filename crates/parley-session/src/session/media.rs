//! Local media bookkeeping and the removal notices that keep the peer's view
//! in sync.

use parley_proto::PeerMessage;

use crate::media::{MediaStream, MediaTrack, TrackKind};

/// The session's local stream, created lazily on the first added track.
#[derive(Debug, Default)]
pub(crate) struct LocalMedia {
    stream: Option<MediaStream>,
}

impl LocalMedia {
    pub(crate) fn stream(&self) -> Option<&MediaStream> {
        self.stream.as_ref()
    }

    pub(crate) fn has(&self, kind: TrackKind) -> bool {
        self.stream
            .as_ref()
            .is_some_and(|stream| stream.track(kind).is_some())
    }

    /// Inserts `track`. Returns it back when a track of that kind is
    /// already active so the caller can release it.
    pub(crate) fn insert(&mut self, track: MediaTrack) -> Result<&MediaStream, MediaTrack> {
        if self.has(track.kind) {
            return Err(track);
        }
        let stream = self.stream.get_or_insert_with(MediaStream::new);
        stream.insert(track);
        Ok(stream)
    }

    /// Removes every track of `kind`. The stream handed back is the one the
    /// tracks were part of; it is dropped locally once empty.
    pub(crate) fn remove(&mut self, kind: TrackKind) -> Option<(Vec<MediaTrack>, MediaStream)> {
        let stream = self.stream.as_mut()?;
        let removed = stream.take(kind);
        if removed.is_empty() {
            return None;
        }
        let snapshot = stream.clone();
        if stream.is_empty() {
            self.stream = None;
        }
        Some((removed, snapshot))
    }

    pub(crate) fn drain(&mut self) -> Vec<MediaTrack> {
        self.stream
            .take()
            .map(|stream| stream.tracks().to_vec())
            .unwrap_or_default()
    }
}

pub(crate) fn removal_notice(kind: TrackKind) -> PeerMessage {
    match kind {
        TrackKind::Audio => PeerMessage::RemoteAudioRemoved,
        TrackKind::Video => PeerMessage::RemoteVideoRemoved,
    }
}

pub(crate) fn removed_kind(message: &PeerMessage) -> Option<TrackKind> {
    match message {
        PeerMessage::RemoteAudioRemoved => Some(TrackKind::Audio),
        PeerMessage::RemoteVideoRemoved => Some(TrackKind::Video),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test_timeout::timeout]
    fn stream_is_created_lazily_and_dropped_when_empty() {
        let mut local = LocalMedia::default();
        assert!(local.stream().is_none());
        assert!(local.remove(TrackKind::Audio).is_none());

        let stream_id = local
            .insert(MediaTrack::new(TrackKind::Audio, "mic"))
            .unwrap()
            .id
            .clone();
        local
            .insert(MediaTrack::new(TrackKind::Video, "cam"))
            .unwrap();
        assert!(local
            .insert(MediaTrack::new(TrackKind::Audio, "mic 2"))
            .is_err());

        let (removed, stream) = local.remove(TrackKind::Audio).unwrap();
        assert_eq!(removed.len(), 1);
        assert_eq!(stream.id, stream_id);
        assert!(local.stream().is_some());

        local.remove(TrackKind::Video).unwrap();
        assert!(local.stream().is_none());
    }

    #[test_timeout::timeout]
    fn removal_notices_map_both_ways() {
        for kind in [TrackKind::Audio, TrackKind::Video] {
            assert_eq!(removed_kind(&removal_notice(kind)), Some(kind));
        }
        assert_eq!(
            removed_kind(&PeerMessage::Signal {
                data: serde_json::Value::Null
            }),
            None
        );
    }
}
