//! PIN generation.

use rand::Rng;

use pindrop_protocol::pin::{PIN_ALPHABET, PIN_LENGTH};

/// Generates a random PIN: 6 symbols drawn uniformly from the 32-symbol
/// alphabet (~30 bits of entropy).
///
/// `thread_rng` is a CSPRNG and `gen_range` samples without modulo bias,
/// so every symbol is equally likely.
pub fn generate_pin() -> String {
    let alphabet = PIN_ALPHABET.as_bytes();
    let mut rng = rand::thread_rng();
    (0..PIN_LENGTH)
        .map(|_| alphabet[rng.gen_range(0..alphabet.len())] as char)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn generated_pins_are_valid() {
        for _ in 0..500 {
            let pin = generate_pin();
            assert!(pindrop_protocol::pin::is_valid(&pin), "invalid pin: {pin}");
        }
    }

    #[test]
    fn generated_pins_vary() {
        let pins: HashSet<String> = (0..100).map(|_| generate_pin()).collect();
        // 32^6 possibilities; 100 draws colliding would mean a broken RNG.
        assert!(pins.len() > 90);
    }

    #[test]
    fn every_symbol_is_reachable() {
        let mut seen = HashSet::new();
        for _ in 0..2_000 {
            for c in generate_pin().chars() {
                seen.insert(c);
            }
        }
        // 12 000 samples over 32 symbols: each should have appeared.
        assert_eq!(seen.len(), PIN_ALPHABET.chars().count());
    }
}
