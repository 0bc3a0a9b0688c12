/// Every part name an order may contain.
pub const PART_NAMES: [&str; 20] = [
    "wheel",
    "rim",
    "tire",
    "brake",
    "seat",
    "cassette",
    "rear-derailleur",
    "front-derailleur",
    "chain",
    "chainring",
    "crankset",
    "pedal",
    "headset",
    "stem",
    "handlerbar",
    "fork",
    "frame",
    "hub",
    "bottle-cage",
    "disk",
];

/// Every bike model that can be ordered.
pub const BIKE_MODELS: [&str; 10] = [
    "mtb-xc",
    "mtb-trail",
    "mtb-enduro",
    "mtb-downhill",
    "bdc-aero",
    "bdc-endurance",
    "gravel",
    "ciclocross",
    "trekking",
    "urban",
];

/// Smallest number of parts an order may have.
pub const MIN_PARTS: usize = 6;

/// Price bounds used when generating orders, inclusive.
pub const MIN_PRICE: i32 = 200;
pub const MAX_PRICE: i32 = 10_000;

pub fn is_known_model(model: &str) -> bool {
    BIKE_MODELS.contains(&model)
}

pub fn is_known_part(name: &str) -> bool {
    PART_NAMES.contains(&name)
}
