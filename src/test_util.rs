use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use sha2::{Digest, Sha256};

// ======================================================================
// FUNCTIONS - CRATE

pub(crate) fn sha256_hex(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

pub(crate) fn random_bytes(len: usize, seed: u8) -> Vec<u8> {
    let mut rng = ChaCha8Rng::from_seed([seed; 32]);
    let mut bytes = vec![0u8; len];
    rng.fill::<[u8]>(&mut bytes);
    bytes
}

pub(crate) fn random_volume_f32(len: usize, seed: u8) -> Vec<f32> {
    let mut rng = ChaCha8Rng::from_seed([seed; 32]);
    (0..len).map(|_| rng.gen_range(0.0..1.0)).collect()
}

// Single-channel layered cube of side `n`: 1 inside the centered
// sphere of the given radius, 0 outside.
pub(crate) fn sphere_volume(n: usize, radius: f64) -> Vec<f32> {
    let center = (n as f64 - 1.0) / 2.0;
    let mut volume = Vec::with_capacity(n * n * n);
    for z in 0..n {
        for y in 0..n {
            for x in 0..n {
                let dx = x as f64 - center;
                let dy = y as f64 - center;
                let dz = z as f64 - center;
                let inside = (dx * dx + dy * dy + dz * dz).sqrt() <= radius;
                volume.push(if inside { 1.0 } else { 0.0 });
            }
        }
    }
    volume
}

// 1D signal of 32 samples: first half 0, second half 1.
pub(crate) fn two_region_1d() -> Vec<f32> {
    let mut signal = vec![0.0; 16];
    signal.extend(std::iter::repeat(1.0).take(16));
    signal
}
