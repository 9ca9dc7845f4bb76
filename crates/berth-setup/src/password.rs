//! Random account passwords.

use rand::Rng;
use rand::distributions::Alphanumeric;

/// Shortest generated password.
pub const MIN_LENGTH: usize = 100;

/// One past the longest generated password.
pub const MAX_LENGTH: usize = 200;

/// Generates an alphanumeric password of random length in
/// `MIN_LENGTH..MAX_LENGTH`.
#[must_use]
pub fn random_password() -> String {
    let mut rng = rand::thread_rng();
    let len = rng.gen_range(MIN_LENGTH..MAX_LENGTH);
    (&mut rng)
        .sample_iter(&Alphanumeric)
        .take(len)
        .map(char::from)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn length_and_alphabet() {
        for _ in 0..50 {
            let password = random_password();
            assert!((MIN_LENGTH..MAX_LENGTH).contains(&password.len()));
            assert!(password.chars().all(|c| c.is_ascii_alphanumeric()));
        }
    }

    #[test]
    fn passwords_differ() {
        assert_ne!(random_password(), random_password());
    }
}
