//! Test pattern generation for simulated camera frames.

/// Pseudo-random noise (glibc LCG) so frames are reproducible.
#[inline]
fn prng(seed: u64) -> u64 {
    seed.wrapping_mul(1103515245).wrapping_add(12345) & 0x7fffffff
}

/// Diagonal gradient with a bright spot whose position encodes the frame
/// number, plus a little noise.
pub fn generate_test_pattern(width: u32, height: u32, frame_num: u64) -> Vec<u16> {
    let w = width as usize;
    let h = height as usize;
    let mut buffer = vec![0u16; w * h];

    let spot_x = (frame_num as usize) % w.max(1);
    let spot_y = (frame_num as usize / w.max(1)) % h.max(1);
    let frame_seed = frame_num.wrapping_mul(2654435761);

    for y in 0..h {
        for x in 0..w {
            let idx = y * w + x;
            let gradient = ((x + y) * 32768 / (w + h).max(1)) as u32;
            let noise = (prng(frame_seed ^ idx as u64) & 0x3FF) as u32;
            let spot = if x == spot_x && y == spot_y { 30000 } else { 0 };
            buffer[idx] = (gradient + noise + spot).min(u32::from(u16::MAX)) as u16;
        }
    }
    buffer
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pattern_is_reproducible_and_frame_dependent() {
        let a = generate_test_pattern(8, 8, 3);
        assert_eq!(a, generate_test_pattern(8, 8, 3));
        assert_ne!(a, generate_test_pattern(8, 8, 4));
        assert_eq!(a.len(), 64);
        assert!(a[3] >= 30000);
    }
}
