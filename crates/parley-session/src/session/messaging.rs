//! Ordered crypto worker for key import and text sealing.
//!
//! Jobs run one at a time in submission order, so inbound messages are
//! surfaced in the order they arrived even though opening them awaits the
//! identity provider.

use std::sync::Arc;

use base64::{engine::general_purpose::STANDARD, Engine};
use parley_proto::{ChatMessage, MessageOrigin};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

use super::SessionError;
use crate::identity::{Identity, IdentityError, IdentityProvider};

pub(crate) type Reply<T> = oneshot::Sender<Result<T, SessionError>>;

pub(crate) enum CryptoJob {
    Import {
        generation: u64,
        name: String,
        public_key: String,
    },
    Seal {
        generation: u64,
        recipient: String,
        message: ChatMessage,
        reply: Reply<ChatMessage>,
    },
    Open {
        author: String,
        payload: String,
    },
}

pub(crate) enum CryptoDone {
    Imported {
        generation: u64,
        result: Result<Identity, IdentityError>,
    },
    Sealed {
        generation: u64,
        message: ChatMessage,
        /// Base64 ciphertext, `None` when sealing failed.
        payload: Option<String>,
        reply: Reply<ChatMessage>,
    },
    Opened(ChatMessage),
}

/// Starts the worker. It stops once the returned sender is dropped.
pub(crate) fn spawn_crypto_worker<F>(
    identity: Arc<dyn IdentityProvider>,
    done: F,
) -> mpsc::UnboundedSender<CryptoJob>
where
    F: Fn(CryptoDone) + Send + 'static,
{
    let (tx, mut rx) = mpsc::unbounded_channel::<CryptoJob>();
    tokio::spawn(async move {
        while let Some(job) = rx.recv().await {
            let outcome = match job {
                CryptoJob::Import {
                    generation,
                    name,
                    public_key,
                } => CryptoDone::Imported {
                    generation,
                    result: identity.import_public_key(&name, &public_key).await,
                },
                CryptoJob::Seal {
                    generation,
                    recipient,
                    message,
                    reply,
                } => {
                    let payload = seal(identity.as_ref(), &message, &recipient).await;
                    CryptoDone::Sealed {
                        generation,
                        message,
                        payload,
                        reply,
                    }
                }
                CryptoJob::Open { author, payload } => {
                    CryptoDone::Opened(open(identity.as_ref(), &author, &payload).await)
                }
            };
            done(outcome);
        }
        debug!(target = "session", "crypto worker stopped");
    });
    tx
}

async fn seal(
    identity: &dyn IdentityProvider,
    message: &ChatMessage,
    recipient: &str,
) -> Option<String> {
    let plaintext = match serde_json::to_vec(message) {
        Ok(bytes) => bytes,
        Err(err) => {
            warn!(target = "session", error = %err, "failed to serialize chat message");
            return None;
        }
    };
    let sealed = identity.encrypt(&plaintext, recipient).await?;
    Some(STANDARD.encode(sealed))
}

/// Opens an inbound `text_message`. Every failure yields the unreadable
/// placeholder instead of an error.
async fn open(identity: &dyn IdentityProvider, author: &str, payload: &str) -> ChatMessage {
    let Ok(sealed) = STANDARD.decode(payload) else {
        warn!(target = "session", author, "text message payload is not base64");
        return ChatMessage::unreadable();
    };
    let Some(plaintext) = identity.decrypt(&sealed, author).await else {
        warn!(target = "session", author, "could not open text message");
        return ChatMessage::unreadable();
    };
    match serde_json::from_slice::<ChatMessage>(&plaintext) {
        Ok(mut message) => {
            message.origin = MessageOrigin::Remote;
            message
        }
        Err(err) => {
            warn!(target = "session", author, error = %err, "opened text message is not a chat message");
            ChatMessage::unreadable()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::SealedBoxIdentity;
    use parley_proto::UNREADABLE_CONTENT;

    async fn pair() -> (Arc<SealedBoxIdentity>, Arc<SealedBoxIdentity>) {
        let alice = Arc::new(SealedBoxIdentity::generate("alice"));
        let bob = Arc::new(SealedBoxIdentity::generate("bob"));
        alice
            .import_public_key("bob", &bob.export_public_key().await)
            .await
            .unwrap();
        bob.import_public_key("alice", &alice.export_public_key().await)
            .await
            .unwrap();
        (alice, bob)
    }

    #[test_timeout::tokio_timeout_test]
    async fn sealed_text_opens_as_remote_message() {
        let (alice, bob) = pair().await;
        let sent = ChatMessage::local("alice", "hi");
        let payload = seal(alice.as_ref(), &sent, "bob").await.expect("sealed");
        assert!(!payload.contains("hi"));

        let received = open(bob.as_ref(), "alice", &payload).await;
        assert_eq!(received.origin, MessageOrigin::Remote);
        assert_eq!(received.author, "alice");
        assert_eq!(received.content, "hi");
        assert_eq!(received.date, sent.date);
    }

    #[test_timeout::tokio_timeout_test]
    async fn unopenable_text_becomes_placeholder() {
        let (alice, bob) = pair().await;
        let payload = seal(alice.as_ref(), &ChatMessage::local("alice", "hi"), "bob")
            .await
            .unwrap();

        assert!(open(bob.as_ref(), "alice", "%%%").await.is_unreadable());
        assert!(open(bob.as_ref(), "mallory", &payload).await.is_unreadable());

        let not_chat = STANDARD.encode(alice.encrypt(b"[1,2,3]", "bob").await.unwrap());
        assert!(open(bob.as_ref(), "alice", &not_chat).await.is_unreadable());

        bob.forget("alice");
        let placeholder = open(bob.as_ref(), "alice", &payload).await;
        assert_eq!(placeholder.content, UNREADABLE_CONTENT);
    }

    #[test_timeout::tokio_timeout_test]
    async fn worker_preserves_submission_order() {
        let (alice, bob) = pair().await;
        let (done_tx, mut done_rx) = mpsc::unbounded_channel();
        let jobs = spawn_crypto_worker(bob.clone(), move |outcome| {
            let _ = done_tx.send(outcome);
        });

        for text in ["one", "two", "three"] {
            let payload = seal(alice.as_ref(), &ChatMessage::local("alice", text), "bob")
                .await
                .unwrap();
            jobs.send(CryptoJob::Open {
                author: "alice".into(),
                payload,
            })
            .unwrap();
        }

        let mut seen = Vec::new();
        for _ in 0..3 {
            match done_rx.recv().await {
                Some(CryptoDone::Opened(message)) => seen.push(message.content),
                _ => panic!("unexpected crypto outcome"),
            }
        }
        assert_eq!(seen, vec!["one", "two", "three"]);
    }
}
