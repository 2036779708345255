use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use tracing::debug;

use crate::core::status::RenderTarget;

/// Telegram caps messages at 4096 characters.
pub const MAX_MESSAGE_LEN: usize = 4096;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessageRef {
    pub chat_id: i64,
    pub message_id: i32,
}

/// Chat operations a status view needs, independent of the bot API
/// behind them.
#[async_trait]
pub trait ChatTransport: Send + Sync {
    async fn send_message(&self, chat_id: i64, text: &str) -> Result<MessageRef>;
    async fn edit_message(&self, msg: MessageRef, text: &str) -> Result<()>;
    async fn delete_message(&self, msg: MessageRef) -> Result<()>;
}

/// Splits long output into chunks that fit a single message,
/// preferring newline boundaries over hard cuts.
pub fn split_message(text: &str, max_len: usize) -> Vec<String> {
    if text.len() <= max_len {
        return vec![text.to_string()];
    }
    let mut chunks = Vec::new();
    let mut rest = text;
    while rest.len() > max_len {
        // Longest char-safe prefix within the limit.
        let mut cut = max_len;
        while !rest.is_char_boundary(cut) {
            cut -= 1;
        }
        // Prefer the last newline in the window, if it leaves a
        // reasonable chunk.
        if let Some(nl) = rest[..cut].rfind('\n')
            && nl > max_len / 2
        {
            cut = nl;
        }
        chunks.push(rest[..cut].to_string());
        rest = rest[cut..].trim_start_matches('\n');
    }
    if !rest.is_empty() {
        chunks.push(rest.to_string());
    }
    chunks
}

/// Projects run status onto one chat message, editing it in place.
/// Finalization deletes the status message and delivers the real
/// answer as fresh messages.
pub struct ChatMessageTarget {
    transport: Arc<dyn ChatTransport>,
    msg: MessageRef,
}

impl ChatMessageTarget {
    pub fn new(transport: Arc<dyn ChatTransport>, msg: MessageRef) -> Self {
        Self { transport, msg }
    }
}

#[async_trait]
impl RenderTarget for ChatMessageTarget {
    async fn render(&mut self, text: &str) -> Result<()> {
        self.transport.edit_message(self.msg, text).await
    }

    async fn finalize(&mut self, text: &str) -> Result<()> {
        if let Err(e) = self.transport.delete_message(self.msg).await {
            debug!(error = %e, "failed to delete status message");
        }
        for chunk in split_message(text, MAX_MESSAGE_LEN) {
            self.transport
                .send_message(self.msg.chat_id, &chunk)
                .await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::Mutex;

    #[derive(Default)]
    struct FakeTransport {
        edits: Mutex<Vec<(MessageRef, String)>>,
        sends: Mutex<Vec<(i64, String)>>,
        deletes: Mutex<Vec<MessageRef>>,
    }

    #[async_trait]
    impl ChatTransport for FakeTransport {
        async fn send_message(&self, chat_id: i64, text: &str) -> Result<MessageRef> {
            let mut sends = self.sends.lock().await;
            sends.push((chat_id, text.to_string()));
            Ok(MessageRef {
                chat_id,
                message_id: sends.len() as i32,
            })
        }

        async fn edit_message(&self, msg: MessageRef, text: &str) -> Result<()> {
            self.edits.lock().await.push((msg, text.to_string()));
            Ok(())
        }

        async fn delete_message(&self, msg: MessageRef) -> Result<()> {
            self.deletes.lock().await.push(msg);
            Ok(())
        }
    }

    #[test]
    fn short_text_is_one_chunk() {
        assert_eq!(split_message("hello", 4096), vec!["hello"]);
    }

    #[test]
    fn long_text_splits_at_newlines() {
        let text = format!("{}\n{}", "a".repeat(3000), "b".repeat(3000));
        let chunks = split_message(&text, 4096);
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0], "a".repeat(3000));
        assert_eq!(chunks[1], "b".repeat(3000));
    }

    #[test]
    fn unbroken_text_hard_cuts() {
        let text = "x".repeat(9000);
        let chunks = split_message(&text, 4096);
        assert_eq!(chunks.len(), 3);
        assert!(chunks.iter().all(|c| c.len() <= 4096));
        assert_eq!(chunks.iter().map(String::len).sum::<usize>(), 9000);
    }

    #[test]
    fn multibyte_text_splits_on_char_boundaries() {
        let text = "é".repeat(3000); // two bytes each
        let chunks = split_message(&text, 4096);
        assert!(chunks.len() >= 2);
        for chunk in &chunks {
            assert!(chunk.len() <= 4096);
            assert!(chunk.chars().all(|c| c == 'é'));
        }
    }

    #[tokio::test]
    async fn finalize_deletes_status_and_sends_answer() {
        let transport = Arc::new(FakeTransport::default());
        let msg = MessageRef {
            chat_id: 10,
            message_id: 1,
        };
        let mut target = ChatMessageTarget::new(transport.clone(), msg);

        let long = format!("{}\n{}", "a".repeat(3000), "b".repeat(3000));
        target.finalize(&long).await.unwrap();

        let deletes = transport.deletes.lock().await;
        let sends = transport.sends.lock().await;
        assert_eq!(deletes.as_slice(), &[msg]);
        assert_eq!(sends.len(), 2);
        assert!(sends.iter().all(|(chat, _)| *chat == 10));
        assert!(transport.edits.lock().await.is_empty());
    }

    #[tokio::test]
    async fn finalize_survives_a_failed_delete() {
        struct DeleteFails(FakeTransport);

        #[async_trait]
        impl ChatTransport for DeleteFails {
            async fn send_message(&self, chat_id: i64, text: &str) -> Result<MessageRef> {
                self.0.send_message(chat_id, text).await
            }
            async fn edit_message(&self, msg: MessageRef, text: &str) -> Result<()> {
                self.0.edit_message(msg, text).await
            }
            async fn delete_message(&self, _msg: MessageRef) -> Result<()> {
                anyhow::bail!("message to delete not found")
            }
        }

        let transport = Arc::new(DeleteFails(FakeTransport::default()));
        let msg = MessageRef {
            chat_id: 4,
            message_id: 9,
        };
        let mut target = ChatMessageTarget::new(transport.clone(), msg);
        target.finalize("done").await.unwrap();

        let sends = transport.0.sends.lock().await;
        assert_eq!(sends.as_slice(), &[(4, "done".to_string())]);
    }

    #[tokio::test]
    async fn render_edits_in_place() {
        let transport = Arc::new(FakeTransport::default());
        let msg = MessageRef {
            chat_id: 3,
            message_id: 7,
        };
        let mut target = ChatMessageTarget::new(transport.clone(), msg);
        target.render("⏳ 5s").await.unwrap();
        target.render("⏳ 6s").await.unwrap();

        let edits = transport.edits.lock().await;
        assert_eq!(edits.len(), 2);
        assert!(transport.sends.lock().await.is_empty());
    }
}
