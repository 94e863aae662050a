pub mod time;

/// Generates a random url-safe identifier, used for work and trace ids.
pub fn longid() -> String {
    nanoid::nanoid!(21)
}
