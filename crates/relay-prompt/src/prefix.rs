use sha2::{Digest, Sha256};

use crate::reducer::Message;
use crate::template::sha256_hex;

/// Cache-key material for provider prompt caches. The prefix hash covers
/// the model, json mode, and head messages; the tail never feeds it.
#[derive(Debug, Clone, PartialEq)]
pub struct PromptCacheKey {
    pub prefix_hash: String,
    pub tail_hash: String,
    pub cache_key: String,
}

fn hash_messages(hasher: &mut Sha256, messages: &[Message]) {
    for message in messages {
        hasher.update(message.role.as_bytes());
        hasher.update(b":");
        hasher.update(message.content.as_bytes());
        hasher.update(b"\n");
    }
}

pub fn compute_cache_key(
    model: &str,
    json_mode: bool,
    head: &[Message],
    tail: &[Message],
) -> PromptCacheKey {
    let mut prefix = Sha256::new();
    prefix.update(model.as_bytes());
    prefix.update(b"|");
    prefix.update(if json_mode { b"json" as &[u8] } else { b"text" });
    prefix.update(b"|");
    hash_messages(&mut prefix, head);
    let prefix_hash = format!("{:064x}", prefix.finalize());

    let mut tail_hasher = Sha256::new();
    hash_messages(&mut tail_hasher, tail);
    let tail_hash = format!("{:064x}", tail_hasher.finalize());

    let cache_key = sha256_hex(&format!("{prefix_hash}|{tail_hash}"));
    PromptCacheKey {
        prefix_hash,
        tail_hash,
        cache_key,
    }
}
