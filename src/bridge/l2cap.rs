//! BLE L2CAP channel bridge
//!
//! The stack hands over a ready duplex channel, so the byte path is the
//! plain channel bridge. What this adds is ownership: the peripheral
//! connection (and with it the central session) is kept alive for as long
//! as the stream pair lives, and a vanished peripheral ends the pair.

use super::channel::channel_pair;
use super::characteristic::BleLink;
use crate::cancel::{CancelReason, CancelToken};
use crate::stream::StreamPair;
use crate::transport::ble::CentralEvent;
use crate::transport::TransportChannels;
use tokio::sync::mpsc;
use tracing::debug;

pub(crate) fn l2cap_pair(
    link: BleLink,
    channels: TransportChannels,
    mut events: mpsc::UnboundedReceiver<CentralEvent>,
) -> StreamPair {
    let token = CancelToken::new();

    let watch = token.clone();
    let peer = link.peer.clone();
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = watch.cancelled() => break,
                event = events.recv() => match event {
                    Some(CentralEvent::Disconnected { peer: gone, reason }) if gone == peer => {
                        debug!("L2CAP peer {} disconnected: {:?}", gone, reason);
                        watch.cancel(CancelReason::Closed);
                        break;
                    }
                    Some(_) => {}
                    None => {
                        watch.cancel(CancelReason::Closed);
                        break;
                    }
                }
            }
        }
    });

    channel_pair(channels, token, Some(Box::new(link)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::StreamEvent;
    use crate::transport::ble::mock::{Call, MockStack};
    use crate::transport::ble::BleStack;
    use bytes::Bytes;
    use std::time::Duration;

    #[tokio::test]
    async fn test_peer_disconnect_ends_pair_and_releases_link() {
        let stack = MockStack::new(vec![]);
        let (central, events) = stack.central();
        let (_to_stream, rx) = mpsc::channel::<std::io::Result<Bytes>>(4);
        let (tx, _from_stream) = mpsc::channel::<Bytes>(4);

        let mut pair = l2cap_pair(
            BleLink {
                central,
                peer: "peer-1".into(),
            },
            TransportChannels { rx, tx },
            events,
        );
        let mut input_events = pair.input.events();
        pair.input.open();

        stack.central.emit(CentralEvent::Disconnected {
            peer: "peer-1".into(),
            reason: None,
        });

        let mut seen = Vec::new();
        while let Ok(Some(event)) =
            tokio::time::timeout(Duration::from_secs(2), input_events.recv()).await
        {
            seen.push(event);
        }
        assert_eq!(
            seen,
            vec![StreamEvent::OpenCompleted, StreamEvent::EndEncountered]
        );

        tokio::time::timeout(Duration::from_secs(2), async {
            while !stack
                .central
                .calls()
                .contains(&Call::CancelConnection("peer-1".into()))
            {
                tokio::task::yield_now().await;
            }
        })
        .await
        .expect("link not released");
        pair.close();
    }
}
