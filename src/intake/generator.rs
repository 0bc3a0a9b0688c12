use crate::model::{AssembleOrder, Part, BIKE_MODELS, MAX_PRICE, MIN_PARTS, MIN_PRICE, PART_NAMES};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::Rng;

/// Produces random but well-formed orders.
#[derive(Debug)]
pub struct OrderGenerator {
    rng: StdRng,
}

impl OrderGenerator {
    pub fn new(rng: StdRng) -> Self {
        Self { rng }
    }

    /// A random order for a random catalog model.
    pub fn generate(&mut self) -> AssembleOrder {
        let model = BIKE_MODELS.choose(&mut self.rng).copied().unwrap_or(BIKE_MODELS[0]);
        self.generate_for_model(model)
    }

    /// A random order for the given model.
    pub fn generate_for_model(&mut self, model: &str) -> AssembleOrder {
        let id = self.next_id();
        let price = self.rng.gen_range(MIN_PRICE..=MAX_PRICE);
        let count = self.rng.gen_range(MIN_PARTS..=PART_NAMES.len());
        let parts = (0..count).map(|_| self.next_part()).collect();
        AssembleOrder::new(id, price, model, parts)
    }

    fn next_part(&mut self) -> Part {
        let name = PART_NAMES.choose(&mut self.rng).copied().unwrap_or(PART_NAMES[0]);
        Part::new(self.next_id(), name, self.next_ean8())
    }

    /// UUID v4 text drawn from this generator's random source.
    fn next_id(&mut self) -> String {
        uuid::Builder::from_random_bytes(self.rng.gen())
            .into_uuid()
            .to_string()
    }

    fn next_ean8(&mut self) -> String {
        let digits: Vec<u32> = (0..7).map(|_| self.rng.gen_range(0..10)).collect();
        let mut code: String = digits.iter().map(|d| char::from(b'0' + *d as u8)).collect();
        code.push(char::from(b'0' + ean8_check_digit(&digits) as u8));
        code
    }
}

/// Check digit of an EAN-8 code from its first seven digits.
pub fn ean8_check_digit(digits: &[u32]) -> u32 {
    let sum: u32 = digits
        .iter()
        .enumerate()
        .map(|(i, d)| if i % 2 == 0 { d * 3 } else { *d })
        .sum();
    (10 - sum % 10) % 10
}
