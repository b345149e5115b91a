use std::sync::Mutex;

use once_cell::sync::Lazy;

static GENERATOR: Lazy<Mutex<ulid::Generator>> = Lazy::new(|| Mutex::new(ulid::Generator::new()));

/// A sortable, prefixed identifier for rows not keyed by a backend-native
/// auto-increment primary key (queue message correlation ids, log spans).
pub fn generate(prefix: &str) -> String {
    let mut generator = GENERATOR.lock().expect("ulid generator mutex poisoned");
    let id = generator
        .generate()
        .expect("failed to generate non-overflowing ulid");

    format!("{prefix}_{id}")
}
