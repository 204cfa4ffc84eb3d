use sha2::{Digest, Sha256};

/// Derives the conversation identity from the first user message's
/// canonical content. OpenAI clients replay the full history every turn,
/// so the first user message is the stable anchor: same content, same
/// fingerprint, same upstream chat.
pub fn conversation_fingerprint(first_user_content: &str) -> String {
    let canonical = serde_json::json!({
        "role": "user",
        "content": first_user_content,
    })
    .to_string();
    format!("{:x}", Sha256::digest(canonical.as_bytes()))
}

#[cfg(test)]
mod tests {
    use super::conversation_fingerprint;

    #[test]
    fn fingerprint_is_pure_and_hex() {
        let first = conversation_fingerprint("hi");
        let second = conversation_fingerprint("hi");
        assert_eq!(first, second);
        assert_eq!(first.len(), 64);
        assert!(first.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn distinct_content_yields_distinct_fingerprints() {
        assert_ne!(
            conversation_fingerprint("hi"),
            conversation_fingerprint("hi!")
        );
    }

    #[test]
    fn content_with_quotes_cannot_collide_via_injection() {
        // The canonical form is JSON-encoded, so crafted quoting in the
        // content cannot fold two conversations together.
        assert_ne!(
            conversation_fingerprint(r#"a","content":"b"#),
            conversation_fingerprint("a")
        );
    }
}
