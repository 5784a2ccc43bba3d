//! Prompt/reply rendezvous between running tasks and incoming messages.
//!
//! A task asking a user a question installs a waiter keyed by
//! `(protocol, user, channel, thread)` and sends the prompt. Only the first
//! waiter on a key sends its prompt; later ones stack behind it. Once the
//! head waiter is answered or times out, the stacked waiters are told to
//! retry so each caller gets an answer within its own timeout.

use crate::retval::RetVal;
use regex::Regex;
use std::collections::HashMap;
use std::future::Future;
use std::sync::{LazyLock, Mutex};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

/// Default time to wait for a reply.
pub const REPLY_TIMEOUT: Duration = Duration::from_secs(45);

/// Timeout for interactive connectors running interpreter or in-process
/// tasks, where a human is typing at a terminal.
pub const INTERACTIVE_REPLY_TIMEOUT: Duration = Duration::from_secs(42 * 60);

/// Attempts made by the public prompt methods before giving up.
pub const PROMPT_ATTEMPTS: usize = 3;

const STOCK_REPLIES: &[(&str, &str)] = &[
    ("Email", r"[\w\-.]+@(?:[\w-]+\.)+[\w-]{2,4}"),
    ("Domain", r"(?:[\w-]+\.)+[\w-]{2,4}"),
    ("OTP", r"\d{6}"),
    (
        "IPaddr",
        r"(?:(?:0|1[0-9]{0,2}|2[0-9]?|2[0-4][0-9]|25[0-5]|[3-9][0-9]?)\.){3}(?:0|1[0-9]{0,2}|2[0-9]?|2[0-4][0-9]|25[0-5]|[3-9][0-9]?)",
    ),
    ("SimpleString", r#"[-\w .,_'"?!]+"#),
    ("YesNo", r"(?i:yes|no|Y|N)"),
];

static STOCK_REGEXES: LazyLock<HashMap<&'static str, Regex>> = LazyLock::new(|| {
    STOCK_REPLIES
        .iter()
        .map(|(name, pattern)| {
            let regex = Regex::new(&format!(r"^\s*{pattern}\s*$")).expect("hardcoded regex");
            (*name, regex)
        })
        .collect()
});

/// Whether `regex_id` names a stock pattern rather than a task matcher.
pub fn is_stock_id(regex_id: &str) -> bool {
    regex_id.starts_with(|c: char| c.is_ascii_uppercase())
}

pub fn stock_regex(regex_id: &str) -> Option<&'static Regex> {
    STOCK_REGEXES.get(regex_id)
}

/// Whether prompts on `protocol` get the long interactive timeout.
pub fn is_interactive_protocol(protocol: &str) -> bool {
    matches!(protocol, "ssh" | "terminal")
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ReplyKey {
    pub protocol: String,
    pub user: String,
    pub channel: String,
    pub thread: String,
}

/// What a waiter receives.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Delivery {
    Replied { matched: bool, text: String },
    Interrupted,
    Retry,
}

#[derive(Debug)]
struct ReplyWaiter {
    id: u64,
    regex: Regex,
    reply: oneshot::Sender<Delivery>,
}

/// Registry of outstanding prompts.
#[derive(Debug)]
pub struct Replies {
    waiters: Mutex<HashMap<ReplyKey, Vec<ReplyWaiter>>>,
    shutdown: Mutex<CancellationToken>,
    next_id: std::sync::atomic::AtomicU64,
}

impl Default for Replies {
    fn default() -> Self {
        Self {
            waiters: Mutex::new(HashMap::new()),
            shutdown: Mutex::new(CancellationToken::new()),
            next_id: std::sync::atomic::AtomicU64::new(1),
        }
    }
}

impl Replies {
    pub fn new() -> Self {
        Self::default()
    }

    fn shutdown_token(&self) -> CancellationToken {
        self.shutdown
            .lock()
            .map(|token| token.clone())
            .unwrap_or_else(|_| {
                let token = CancellationToken::new();
                token.cancel();
                token
            })
    }

    /// Interrupt every outstanding prompt and refuse new ones until
    /// [`reset`](Self::reset).
    pub fn shutdown(&self) {
        if let Ok(token) = self.shutdown.lock() {
            token.cancel();
        }
    }

    /// Re-arm after a shutdown; used when the robot restarts in process.
    pub fn reset(&self) {
        if let Ok(mut token) = self.shutdown.lock() {
            *token = CancellationToken::new();
        }
    }

    pub fn is_waiting(&self, key: &ReplyKey) -> bool {
        self.waiters
            .lock()
            .map(|waiters| waiters.contains_key(key))
            .unwrap_or(false)
    }

    /// Offer an incoming message to a waiting prompt. Returns true when a
    /// waiter consumed it, in which case the dispatcher drops the message.
    pub fn deliver(&self, key: &ReplyKey, text: &str, is_command: bool) -> bool {
        let Some(waitlist) = self
            .waiters
            .lock()
            .ok()
            .and_then(|mut waiters| waiters.remove(key))
        else {
            return false;
        };
        let mut waitlist = waitlist.into_iter();
        if let Some(head) = waitlist.next() {
            let matched = head.regex.is_match(text);
            let delivery = if !matched && is_command && text != "=" && text != "-" {
                Delivery::Interrupted
            } else {
                Delivery::Replied {
                    matched,
                    text: text.to_string(),
                }
            };
            let _ = head.reply.send(delivery);
        }
        for stacked in waitlist {
            let _ = stacked.reply.send(Delivery::Retry);
        }
        true
    }

    /// Install a waiter and wait for one reply. `send_prompt` runs only
    /// when no other prompt is pending on the key.
    ///
    /// May return [`RetVal::RetryPrompt`]; see [`prompt`](Self::prompt).
    pub async fn wait_once<F>(
        &self,
        key: &ReplyKey,
        regex: Regex,
        timeout: Duration,
        send_prompt: F,
    ) -> (String, RetVal)
    where
        F: Future<Output = RetVal>,
    {
        let shutdown = self.shutdown_token();
        if shutdown.is_cancelled() {
            return (String::new(), RetVal::Interrupted);
        }
        let id = self
            .next_id
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        let (tx, mut rx) = oneshot::channel();
        let waiter = ReplyWaiter {
            id,
            regex,
            reply: tx,
        };

        let is_head = {
            let Ok(mut waiters) = self.waiters.lock() else {
                return (String::new(), RetVal::Interrupted);
            };
            match waiters.get_mut(key) {
                Some(waitlist) => {
                    tracing::debug!(user = %key.user, channel = %key.channel, "stacking prompt behind pending waiter");
                    waitlist.push(waiter);
                    false
                }
                None => {
                    waiters.insert(key.clone(), vec![waiter]);
                    true
                }
            }
        };

        if is_head {
            let ret = send_prompt.await;
            if ret != RetVal::Ok {
                self.abandon(key, id);
                return (String::new(), ret);
            }
        }

        let delivery = tokio::select! {
            delivery = &mut rx => delivery.unwrap_or(Delivery::Interrupted),
            _ = tokio::time::sleep(timeout) => {
                tracing::warn!(
                    protocol = %key.protocol,
                    channel = %key.channel,
                    ?timeout,
                    "timed out waiting for a reply"
                );
                if self.abandon(key, id) {
                    return (String::new(), RetVal::TimeoutExpired);
                }
                // Lost the race with a delivery at the deadline.
                rx.await.unwrap_or(Delivery::Interrupted)
            }
            _ = shutdown.cancelled() => {
                if let Ok(mut waiters) = self.waiters.lock() {
                    waiters.remove(key);
                }
                return (String::new(), RetVal::Interrupted);
            }
        };

        match delivery {
            Delivery::Interrupted => (String::new(), RetVal::Interrupted),
            Delivery::Retry => (String::new(), RetVal::RetryPrompt),
            Delivery::Replied { matched: true, text } => (text, RetVal::Ok),
            Delivery::Replied { text, .. } => match text.as_str() {
                "=" => (String::new(), RetVal::UseDefaultValue),
                "-" => (String::new(), RetVal::Interrupted),
                _ => (String::new(), RetVal::ReplyNotMatched),
            },
        }
    }

    /// Prompt with retries: a stacked waiter that is told to retry tries
    /// again, up to [`PROMPT_ATTEMPTS`] times, then gives up as Interrupted.
    pub async fn prompt<F, Fut>(
        &self,
        key: &ReplyKey,
        regex: &Regex,
        timeout: Duration,
        mut send_prompt: F,
    ) -> (String, RetVal)
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = RetVal>,
    {
        for _ in 0..PROMPT_ATTEMPTS {
            let (reply, ret) = self
                .wait_once(key, regex.clone(), timeout, send_prompt())
                .await;
            if ret != RetVal::RetryPrompt {
                return (reply, ret);
            }
        }
        (String::new(), RetVal::Interrupted)
    }

    /// Remove waiter `id`. When it was the head, the whole key is cleared
    /// and stacked waiters are told to retry. Returns false when the waiter
    /// was already gone.
    fn abandon(&self, key: &ReplyKey, id: u64) -> bool {
        let Ok(mut waiters) = self.waiters.lock() else {
            return false;
        };
        let Some(waitlist) = waiters.get_mut(key) else {
            return false;
        };
        let Some(position) = waitlist.iter().position(|waiter| waiter.id == id) else {
            return false;
        };
        if position == 0 {
            let Some(waitlist) = waiters.remove(key) else {
                return false;
            };
            for stacked in waitlist.into_iter().skip(1) {
                let _ = stacked.reply.send(Delivery::Retry);
            }
        } else {
            waitlist.remove(position);
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn key(user: &str) -> ReplyKey {
        ReplyKey {
            protocol: "test".into(),
            user: user.into(),
            channel: "general".into(),
            thread: String::new(),
        }
    }

    async fn wait_registered(replies: &Replies, key: &ReplyKey) {
        for _ in 0..100 {
            if replies.is_waiting(key) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("waiter never registered");
    }

    #[test]
    fn stock_patterns_are_anchored() {
        let otp = stock_regex("OTP").expect("OTP");
        assert!(otp.is_match(" 123456 "));
        assert!(!otp.is_match("1234567"));
        let yes_no = stock_regex("YesNo").expect("YesNo");
        assert!(yes_no.is_match("Yes"));
        assert!(!yes_no.is_match("maybe"));
        assert!(stock_regex("Email").expect("Email").is_match("alice@example.com"));
        assert!(is_stock_id("SimpleString"));
        assert!(!is_stock_id("favorite"));
    }

    #[tokio::test]
    async fn matching_reply_is_returned() {
        let replies = Arc::new(Replies::new());
        let alice = key("alice");
        let waiter = {
            let replies = replies.clone();
            let alice = alice.clone();
            tokio::spawn(async move {
                let regex = stock_regex("YesNo").expect("stock").clone();
                replies
                    .prompt(&alice, &regex, REPLY_TIMEOUT, || async { RetVal::Ok })
                    .await
            })
        };
        wait_registered(&replies, &alice).await;
        assert!(!replies.deliver(&key("bob"), "yes", false));
        assert!(replies.deliver(&alice, "yes", false));
        assert_eq!(waiter.await.expect("join"), ("yes".to_string(), RetVal::Ok));
        assert!(!replies.is_waiting(&alice));
    }

    #[tokio::test]
    async fn special_replies_and_commands() {
        let cases = [
            ("=", false, RetVal::UseDefaultValue),
            ("-", false, RetVal::Interrupted),
            ("ping", true, RetVal::Interrupted),
            ("banana", false, RetVal::ReplyNotMatched),
        ];
        for (text, is_command, expected) in cases {
            let replies = Arc::new(Replies::new());
            let alice = key("alice");
            let waiter = {
                let replies = replies.clone();
                let alice = alice.clone();
                tokio::spawn(async move {
                    let regex = stock_regex("OTP").expect("stock").clone();
                    replies
                        .wait_once(&alice, regex, REPLY_TIMEOUT, async { RetVal::Ok })
                        .await
                })
            };
            wait_registered(&replies, &alice).await;
            replies.deliver(&alice, text, is_command);
            assert_eq!(waiter.await.expect("join").1, expected, "reply {text:?}");
        }
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_expires_and_frees_the_key() {
        let replies = Replies::new();
        let alice = key("alice");
        let regex = stock_regex("OTP").expect("stock").clone();
        let (text, ret) = replies
            .wait_once(&alice, regex, Duration::from_secs(45), async { RetVal::Ok })
            .await;
        assert_eq!(ret, RetVal::TimeoutExpired);
        assert!(text.is_empty());
        assert!(!replies.is_waiting(&alice));
    }

    #[tokio::test]
    async fn stacked_prompt_retries_after_head_is_answered() {
        let replies = Arc::new(Replies::new());
        let alice = key("alice");
        let prompts_sent = Arc::new(AtomicUsize::new(0));

        let spawn_prompt = |id: &'static str| {
            let replies = replies.clone();
            let alice = alice.clone();
            let prompts_sent = prompts_sent.clone();
            tokio::spawn(async move {
                let regex = stock_regex("SimpleString").expect("stock").clone();
                let result = replies
                    .prompt(&alice, &regex, REPLY_TIMEOUT, || {
                        let prompts_sent = prompts_sent.clone();
                        async move {
                            prompts_sent.fetch_add(1, Ordering::SeqCst);
                            RetVal::Ok
                        }
                    })
                    .await;
                (id, result)
            })
        };

        let first = spawn_prompt("first");
        wait_registered(&replies, &alice).await;
        let second = spawn_prompt("second");
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(prompts_sent.load(Ordering::SeqCst), 1);

        assert!(replies.deliver(&alice, "answer one", false));
        let (_, first_result) = first.await.expect("join");
        assert_eq!(first_result, ("answer one".to_string(), RetVal::Ok));

        wait_registered(&replies, &alice).await;
        assert_eq!(prompts_sent.load(Ordering::SeqCst), 2);
        assert!(replies.deliver(&alice, "answer two", false));
        let (_, second_result) = second.await.expect("join");
        assert_eq!(second_result, ("answer two".to_string(), RetVal::Ok));
    }

    #[tokio::test]
    async fn shutdown_interrupts_waiters_until_reset() {
        let replies = Arc::new(Replies::new());
        let alice = key("alice");
        let waiter = {
            let replies = replies.clone();
            let alice = alice.clone();
            tokio::spawn(async move {
                let regex = stock_regex("OTP").expect("stock").clone();
                replies
                    .wait_once(&alice, regex, REPLY_TIMEOUT, async { RetVal::Ok })
                    .await
            })
        };
        wait_registered(&replies, &alice).await;
        replies.shutdown();
        assert_eq!(
            waiter.await.expect("join"),
            (String::new(), RetVal::Interrupted)
        );
        assert!(!replies.is_waiting(&alice));

        let regex = stock_regex("OTP").expect("stock").clone();
        let (_, ret) = replies
            .wait_once(&alice, regex, REPLY_TIMEOUT, async { RetVal::Ok })
            .await;
        assert_eq!(ret, RetVal::Interrupted);
        replies.reset();
        assert!(!replies.shutdown_token().is_cancelled());
    }
}
