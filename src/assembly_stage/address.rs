use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::Rng;

const STREETS: [&str; 12] = [
    "Via Roma",
    "Corso Vittorio Emanuele",
    "Via Garibaldi",
    "Piazza del Duomo",
    "Via Dante",
    "Viale Europa",
    "Via Mazzini",
    "Via Verdi",
    "Lungomare Colombo",
    "Via dei Mille",
    "Strada Statale 36",
    "Via Cavour",
];

const CITIES: [&str; 10] = [
    "Milano",
    "Torino",
    "Bologna",
    "Firenze",
    "Verona",
    "Bergamo",
    "Trento",
    "Padova",
    "Genova",
    "Lecco",
];

/// Synthesizes delivery addresses from the assembly stage's own random source.
#[derive(Debug)]
pub struct AddressGenerator {
    rng: StdRng,
}

impl AddressGenerator {
    pub fn new(rng: StdRng) -> Self {
        Self { rng }
    }

    /// Something like `"42 Via Roma, 20121 Milano"`. Never empty.
    pub fn next_address(&mut self) -> String {
        let number: u16 = self.rng.gen_range(1..=250);
        let postal: u32 = self.rng.gen_range(10_000..=98_199);
        let street = STREETS.choose(&mut self.rng).copied().unwrap_or(STREETS[0]);
        let city = CITIES.choose(&mut self.rng).copied().unwrap_or(CITIES[0]);
        format!("{} {}, {:05} {}", number, street, postal, city)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;

    #[test]
    fn test_same_seed_same_addresses() {
        let mut a = AddressGenerator::new(StdRng::seed_from_u64(3));
        let mut b = AddressGenerator::new(StdRng::seed_from_u64(3));
        for _ in 0..5 {
            let address = a.next_address();
            assert!(!address.is_empty());
            assert_eq!(address, b.next_address());
        }
    }
}
