use rand::Rng;

// --- Helper Functions ---

// Initial regrowth timer for one cell: half the cells start edible, the rest
// start somewhere in 1..=grass_restart.
pub fn random_grass_timer<R: Rng>(rng: &mut R, grass_restart: u32) -> u32 {
    if rng.gen_range(0..2u32) == 0 {
        0
    } else {
        1 + rng.gen_range(0..grass_restart)
    }
}

// Smallest multiple of `multiple` that is >= `value`. Always rounds up.
pub fn round_up(value: usize, multiple: usize) -> usize {
    value.div_ceil(multiple) * multiple
}

pub fn format_ns(ns: u64) -> String {
    if ns >= 1_000_000_000 {
        format!("{:.3} s", ns as f64 / 1e9)
    } else if ns >= 1_000_000 {
        format!("{:.3} ms", ns as f64 / 1e6)
    } else if ns >= 1_000 {
        format!("{:.3} us", ns as f64 / 1e3)
    } else {
        format!("{ns} ns")
    }
}
