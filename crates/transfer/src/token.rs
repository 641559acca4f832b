//! Resume token generation and comparison.

use rand::Rng;

const TOKEN_BYTES: usize = 16;

/// Generates a CSPRNG resume token as a 32-character lowercase hex string.
pub fn generate_token() -> String {
    let mut bytes = [0u8; TOKEN_BYTES];
    rand::thread_rng().fill(&mut bytes);
    hex::encode(bytes)
}

/// Compares a presented token against the recorded one in constant time.
pub fn validate_token(presented: &str, recorded: &str) -> bool {
    if presented.len() != recorded.len() {
        return false;
    }
    presented
        .bytes()
        .zip(recorded.bytes())
        .fold(0u8, |diff, (a, b)| diff | (a ^ b))
        == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn token_shape() {
        let token = generate_token();
        assert_eq!(token.len(), 32);
        assert!(token.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn tokens_are_unique() {
        assert_ne!(generate_token(), generate_token());
    }

    #[test]
    fn validate() {
        let token = generate_token();
        assert!(validate_token(&token, &token));
        assert!(!validate_token(&token, &generate_token()));
        assert!(!validate_token("short", &token));
    }
}
