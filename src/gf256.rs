//! GF(2^8) arithmetic shared by both codec sides.
//!
//! Byte addition is XOR; multiplication and inversion go through shared
//! log/exp tables over the AES polynomial. The exp table is doubled so a
//! log-sum lookup needs no modulo. Row operations process bytes in 8-byte
//! chunks where possible; results do not depend on the chunk width.

const GF_ORDER: usize = 256;
const IRREDUCIBLE_POLY: u16 = 0x11D; // Standard AES polynomial: x^8 + x^4 + x^3 + x^2 + 1

static mut LOG_TABLE: [u8; GF_ORDER] = [0; GF_ORDER];
static mut EXP_TABLE: [u8; GF_ORDER * 2] = [0; GF_ORDER * 2];

/// Initializes the Galois Field log/exp tables for fast arithmetic.
/// Safe to call more than once; only the first call does work.
pub fn init_gf_tables() {
    static GF_INIT: std::sync::Once = std::sync::Once::new();
    GF_INIT.call_once(|| {
        unsafe {
            let mut x: u16 = 1;
            for i in 0..255 {
                EXP_TABLE[i] = x as u8;
                EXP_TABLE[i + 255] = x as u8; // For handling wrap-around
                LOG_TABLE[x as usize] = i as u8;
                x <<= 1;
                if x >= 256 {
                    x ^= IRREDUCIBLE_POLY;
                }
            }
        }
    });
}

#[inline(always)]
pub fn gf_mul(a: u8, b: u8) -> u8 {
    if a == 0 || b == 0 {
        return 0;
    }
    unsafe {
        let log_a = LOG_TABLE[a as usize] as u16;
        let log_b = LOG_TABLE[b as usize] as u16;
        EXP_TABLE[(log_a + log_b) as usize]
    }
}

/// Computes the multiplicative inverse of `a` in GF(2^8).
#[inline(always)]
pub fn gf_inv(a: u8) -> u8 {
    if a == 0 {
        panic!("Inverse of 0 is undefined in GF(2^8)");
    }
    unsafe { EXP_TABLE[255 - LOG_TABLE[a as usize] as usize] }
}

/// `dst ^= src` over the shorter of the two lengths.
pub fn xor_slice(dst: &mut [u8], src: &[u8]) {
    let n = dst.len().min(src.len());
    let (dst, src) = (&mut dst[..n], &src[..n]);
    let mut dst_chunks = dst.chunks_exact_mut(8);
    let mut src_chunks = src.chunks_exact(8);
    for (d, s) in dst_chunks.by_ref().zip(src_chunks.by_ref()) {
        let word = u64::from_ne_bytes((&*d).try_into().unwrap())
            ^ u64::from_ne_bytes(s.try_into().unwrap());
        d.copy_from_slice(&word.to_ne_bytes());
    }
    for (d, s) in dst_chunks
        .into_remainder()
        .iter_mut()
        .zip(src_chunks.remainder())
    {
        *d ^= *s;
    }
}

/// `dst[i] ^= coeff * src[i]` over the shorter of the two lengths.
/// Dispatches to plain XOR for the parity coefficient.
pub fn muladd_slice(dst: &mut [u8], src: &[u8], coeff: u8) {
    if coeff == 0 {
        return;
    }
    if coeff == 1 {
        xor_slice(dst, src);
        return;
    }
    let n = dst.len().min(src.len());
    unsafe {
        let log_c = LOG_TABLE[coeff as usize] as u16;
        for i in 0..n {
            let s = src[i];
            if s != 0 {
                dst[i] ^= EXP_TABLE[(log_c + LOG_TABLE[s as usize] as u16) as usize];
            }
        }
    }
}

/// In-place `dst[i] *= coeff`.
pub fn mul_slice(dst: &mut [u8], coeff: u8) {
    if coeff == 1 {
        return;
    }
    if coeff == 0 {
        dst.iter_mut().for_each(|b| *b = 0);
        return;
    }
    unsafe {
        let log_c = LOG_TABLE[coeff as usize] as u16;
        for b in dst.iter_mut() {
            if *b != 0 {
                *b = EXP_TABLE[(log_c + LOG_TABLE[*b as usize] as u16) as usize];
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Shift-and-add reference multiply.
    fn gf_mul_shift(mut a: u8, mut b: u8) -> u8 {
        let mut res = 0u8;
        while b != 0 {
            if b & 1 != 0 {
                res ^= a;
            }
            let carry = a & 0x80;
            a <<= 1;
            if carry != 0 {
                a ^= IRREDUCIBLE_POLY as u8;
            }
            b >>= 1;
        }
        res
    }

    #[test]
    fn table_mul_matches_reference() {
        init_gf_tables();
        for a in 0..=255u8 {
            for b in [0u8, 1, 2, 3, 0x53, 0xCA, 0xFF] {
                assert_eq!(gf_mul(a, b), gf_mul_shift(a, b), "a={} b={}", a, b);
            }
        }
    }

    #[test]
    fn inverse_round_trips() {
        init_gf_tables();
        for a in 1..=255u8 {
            assert_eq!(gf_mul(a, gf_inv(a)), 1, "a={}", a);
        }
    }

    #[test]
    fn muladd_matches_per_byte() {
        init_gf_tables();
        let src: Vec<u8> = (0..37u8).map(|i| i.wrapping_mul(11)).collect();
        let mut dst = vec![0x5Au8; 37];
        let expected: Vec<u8> = dst
            .iter()
            .zip(&src)
            .map(|(&d, &s)| d ^ gf_mul(0x1D, s))
            .collect();
        muladd_slice(&mut dst, &src, 0x1D);
        assert_eq!(dst, expected);
    }

    #[test]
    fn muladd_parity_is_xor() {
        init_gf_tables();
        let src = [1u8, 2, 3, 4, 5, 6, 7, 8, 9];
        let mut dst = [0xFFu8; 9];
        muladd_slice(&mut dst, &src, 1);
        for (i, b) in dst.iter().enumerate() {
            assert_eq!(*b, 0xFF ^ src[i]);
        }
    }

    #[test]
    fn mul_slice_then_inverse_restores() {
        init_gf_tables();
        let original: Vec<u8> = (0..100u8).collect();
        let mut data = original.clone();
        mul_slice(&mut data, 0xB7);
        mul_slice(&mut data, gf_inv(0xB7));
        assert_eq!(data, original);
    }

    #[test]
    fn xor_handles_uneven_lengths() {
        let mut dst = vec![0u8; 13];
        let src = vec![0xAAu8; 20];
        xor_slice(&mut dst, &src);
        assert!(dst.iter().all(|&b| b == 0xAA));
    }
}
