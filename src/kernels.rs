//! Byte kernels used to build and solve parity packets.
//!
//! All parity math happens in GF(2^8) with the 0x14d reduction polynomial.
//! Addition in that field is XOR, so the all-ones coefficient row used for
//! parity 0 degenerates into a plain XOR of the group, and single-parity
//! groups never touch a multiplication table.
//!
//! Every kernel exists in two versions: a portable scalar version (public,
//! suffixed `_scalar`) and a SIMD version selected at runtime when the
//! `simd` feature is enabled. Both must produce identical bytes; the tests
//! at the bottom of this file check that on random input.

use gf256::gf::gf;

#[gf(polynomial = 0x14d, generator = 0x2)]
pub type Gf256;

// =============================================================================
// Cauchy coefficients
// =============================================================================

/// Coefficient applied to data slot `data_index` when computing parity row
/// `parity_index` of a group with `k` data slots.
///
/// The matrix is a Cauchy matrix with columns normalised so the first row is
/// all ones:
///
/// ```text
/// a_ij = (y_j + x_0) / (x_i + y_j),  x_i = k + i,  x_0 = k,  y_j = j
/// ```
///
/// Any square submatrix is invertible, which is what lets a receiver solve
/// for up to `r` missing slots. Callers must keep `k + parity_index <= 255`.
#[inline]
pub fn cauchy_coefficient(parity_index: u8, k: u8, data_index: u8) -> u8 {
    debug_assert!(data_index < k);
    debug_assert!((k as u16) + (parity_index as u16) <= 255);

    let x_i = Gf256(k.wrapping_add(parity_index));
    let x_0 = Gf256(k);
    let y_j = Gf256(data_index);
    ((y_j + x_0) / (x_i + y_j)).0
}

/// Product of two field elements.
#[inline]
pub fn gf_mul(a: u8, b: u8) -> u8 {
    MUL_TABLES.get(b)[a as usize]
}

/// Multiplicative inverse, `None` for zero.
#[inline]
pub fn gf_inv(a: u8) -> Option<u8> {
    if a == 0 {
        return None;
    }
    Some((Gf256(1) / Gf256(a)).0)
}

// =============================================================================
// Lookup tables
// =============================================================================

/// `tables[y][x] = x * y`, built at compile time.
struct MulTables {
    tables: [[u8; 256]; 256],
}

impl MulTables {
    const fn new() -> Self {
        let mut tables = [[0u8; 256]; 256];
        let mut y = 0usize;
        while y < 256 {
            let mut x = 0usize;
            while x < 256 {
                tables[y][x] = Self::gf_mul(x as u8, y as u8);
                x += 1;
            }
            y += 1;
        }
        Self { tables }
    }

    /// Carry-less multiply then reduce by 0x14d.
    const fn gf_mul(a: u8, b: u8) -> u8 {
        let mut result = 0u16;
        let mut aa = a as u16;
        let mut bb = b;

        let mut i = 0;
        while i < 8 {
            if bb & 1 != 0 {
                result ^= aa;
            }
            aa <<= 1;
            bb >>= 1;
            i += 1;
        }

        let mut i = 15;
        while i >= 8 {
            if result & (1 << i) != 0 {
                result ^= 0x14d << (i - 8);
            }
            i -= 1;
        }

        result as u8
    }

    #[inline(always)]
    fn get(&self, y: u8) -> &[u8; 256] {
        &self.tables[y as usize]
    }
}

static MUL_TABLES: MulTables = MulTables::new();

/// Split-nibble tables for shuffle-based multiplication:
/// `x * y = lo[y][x & 0x0f] ^ hi[y][x >> 4]`.
#[cfg_attr(
    not(all(feature = "simd", any(target_arch = "x86_64", target_arch = "aarch64"))),
    allow(dead_code)
)]
struct NibbleTables {
    lo: [[u8; 16]; 256],
    hi: [[u8; 16]; 256],
}

#[cfg_attr(
    not(all(feature = "simd", any(target_arch = "x86_64", target_arch = "aarch64"))),
    allow(dead_code)
)]
impl NibbleTables {
    const fn new() -> Self {
        let mut lo = [[0u8; 16]; 256];
        let mut hi = [[0u8; 16]; 256];

        let mut y = 0usize;
        while y < 256 {
            let mut x = 0usize;
            while x < 16 {
                lo[y][x] = MulTables::gf_mul(x as u8, y as u8);
                hi[y][x] = MulTables::gf_mul((x << 4) as u8, y as u8);
                x += 1;
            }
            y += 1;
        }

        Self { lo, hi }
    }
}

#[cfg_attr(
    not(all(feature = "simd", any(target_arch = "x86_64", target_arch = "aarch64"))),
    allow(dead_code)
)]
static NIBBLE_TABLES: NibbleTables = NibbleTables::new();

// =============================================================================
// x86_64
// =============================================================================

#[cfg(all(feature = "simd", target_arch = "x86_64"))]
mod simd_x86 {
    use super::NIBBLE_TABLES;
    use std::arch::x86_64::*;

    /// `dst ^= src`, 64 bytes per iteration then 16.
    #[target_feature(enable = "sse2")]
    pub unsafe fn xor_sse2(dst: &mut [u8], src: &[u8]) {
        let len = dst.len();
        let d = dst.as_mut_ptr();
        let s = src.as_ptr();

        let mut off = 0;
        while off + 64 <= len {
            let a0 = _mm_loadu_si128(d.add(off) as *const __m128i);
            let a1 = _mm_loadu_si128(d.add(off + 16) as *const __m128i);
            let a2 = _mm_loadu_si128(d.add(off + 32) as *const __m128i);
            let a3 = _mm_loadu_si128(d.add(off + 48) as *const __m128i);
            let b0 = _mm_loadu_si128(s.add(off) as *const __m128i);
            let b1 = _mm_loadu_si128(s.add(off + 16) as *const __m128i);
            let b2 = _mm_loadu_si128(s.add(off + 32) as *const __m128i);
            let b3 = _mm_loadu_si128(s.add(off + 48) as *const __m128i);
            _mm_storeu_si128(d.add(off) as *mut __m128i, _mm_xor_si128(a0, b0));
            _mm_storeu_si128(d.add(off + 16) as *mut __m128i, _mm_xor_si128(a1, b1));
            _mm_storeu_si128(d.add(off + 32) as *mut __m128i, _mm_xor_si128(a2, b2));
            _mm_storeu_si128(d.add(off + 48) as *mut __m128i, _mm_xor_si128(a3, b3));
            off += 64;
        }
        while off + 16 <= len {
            let a = _mm_loadu_si128(d.add(off) as *const __m128i);
            let b = _mm_loadu_si128(s.add(off) as *const __m128i);
            _mm_storeu_si128(d.add(off) as *mut __m128i, _mm_xor_si128(a, b));
            off += 16;
        }

        for (x, y) in dst[off..].iter_mut().zip(&src[off..]) {
            *x ^= *y;
        }
    }

    /// `dst ^= src * coeff` using pshufb nibble lookups.
    #[target_feature(enable = "ssse3")]
    pub unsafe fn mul_add_ssse3(dst: &mut [u8], src: &[u8], coeff: u8) {
        let len = dst.len();
        let d = dst.as_mut_ptr();
        let s = src.as_ptr();

        let table_lo = _mm_loadu_si128(NIBBLE_TABLES.lo[coeff as usize].as_ptr() as *const __m128i);
        let table_hi = _mm_loadu_si128(NIBBLE_TABLES.hi[coeff as usize].as_ptr() as *const __m128i);
        let mask_0f = _mm_set1_epi8(0x0f);

        let mut off = 0;
        while off + 16 <= len {
            let data = _mm_loadu_si128(s.add(off) as *const __m128i);
            let lo = _mm_shuffle_epi8(table_lo, _mm_and_si128(data, mask_0f));
            let hi = _mm_shuffle_epi8(table_hi, _mm_and_si128(_mm_srli_epi64(data, 4), mask_0f));
            let acc = _mm_loadu_si128(d.add(off) as *const __m128i);
            _mm_storeu_si128(
                d.add(off) as *mut __m128i,
                _mm_xor_si128(acc, _mm_xor_si128(lo, hi)),
            );
            off += 16;
        }

        let lo = &NIBBLE_TABLES.lo[coeff as usize];
        let hi = &NIBBLE_TABLES.hi[coeff as usize];
        for (x, y) in dst[off..].iter_mut().zip(&src[off..]) {
            *x ^= lo[(*y & 0x0f) as usize] ^ hi[(*y >> 4) as usize];
        }
    }
}

// =============================================================================
// aarch64
// =============================================================================

#[cfg(all(feature = "simd", target_arch = "aarch64"))]
mod simd_neon {
    use super::NIBBLE_TABLES;
    use std::arch::aarch64::*;

    #[target_feature(enable = "neon")]
    pub unsafe fn xor_neon(dst: &mut [u8], src: &[u8]) {
        let len = dst.len();
        let d = dst.as_mut_ptr();
        let s = src.as_ptr();

        let mut off = 0;
        while off + 16 <= len {
            let a = vld1q_u8(d.add(off));
            let b = vld1q_u8(s.add(off));
            vst1q_u8(d.add(off), veorq_u8(a, b));
            off += 16;
        }

        for (x, y) in dst[off..].iter_mut().zip(&src[off..]) {
            *x ^= *y;
        }
    }

    #[target_feature(enable = "neon")]
    pub unsafe fn mul_add_neon(dst: &mut [u8], src: &[u8], coeff: u8) {
        let len = dst.len();
        let d = dst.as_mut_ptr();
        let s = src.as_ptr();

        let table_lo = vld1q_u8(NIBBLE_TABLES.lo[coeff as usize].as_ptr());
        let table_hi = vld1q_u8(NIBBLE_TABLES.hi[coeff as usize].as_ptr());
        let mask_0f = vdupq_n_u8(0x0f);

        let mut off = 0;
        while off + 16 <= len {
            let data = vld1q_u8(s.add(off));
            let lo = vqtbl1q_u8(table_lo, vandq_u8(data, mask_0f));
            let hi = vqtbl1q_u8(table_hi, vshrq_n_u8(data, 4));
            let acc = vld1q_u8(d.add(off));
            vst1q_u8(d.add(off), veorq_u8(acc, veorq_u8(lo, hi)));
            off += 16;
        }

        let lo = &NIBBLE_TABLES.lo[coeff as usize];
        let hi = &NIBBLE_TABLES.hi[coeff as usize];
        for (x, y) in dst[off..].iter_mut().zip(&src[off..]) {
            *x ^= lo[(*y & 0x0f) as usize] ^ hi[(*y >> 4) as usize];
        }
    }
}

// =============================================================================
// Public kernels
// =============================================================================

/// Name of the kernel family selected on this machine.
#[cfg(all(feature = "simd", target_arch = "x86_64"))]
pub fn backend() -> &'static str {
    if std::is_x86_feature_detected!("ssse3") {
        "ssse3"
    } else {
        "sse2"
    }
}

/// Name of the kernel family selected on this machine.
#[cfg(all(feature = "simd", target_arch = "aarch64"))]
pub fn backend() -> &'static str {
    "neon"
}

/// Name of the kernel family selected on this machine.
#[cfg(not(all(feature = "simd", any(target_arch = "x86_64", target_arch = "aarch64"))))]
pub fn backend() -> &'static str {
    "scalar"
}

/// `dst[i] ^= src[i]`. Slices must have equal length.
#[inline]
pub fn xor_into(dst: &mut [u8], src: &[u8]) {
    debug_assert_eq!(dst.len(), src.len());
    let n = dst.len().min(src.len());
    let (dst, src) = (&mut dst[..n], &src[..n]);

    #[cfg(all(feature = "simd", target_arch = "x86_64"))]
    {
        // SSE2 is part of the x86_64 baseline.
        unsafe { simd_x86::xor_sse2(dst, src) };
        return;
    }

    #[cfg(all(feature = "simd", target_arch = "aarch64"))]
    {
        unsafe { simd_neon::xor_neon(dst, src) };
        return;
    }

    #[cfg(not(all(feature = "simd", any(target_arch = "x86_64", target_arch = "aarch64"))))]
    {
        xor_into_scalar(dst, src);
    }
}

/// Portable version of [`xor_into`], eight bytes at a time.
pub fn xor_into_scalar(dst: &mut [u8], src: &[u8]) {
    debug_assert_eq!(dst.len(), src.len());

    let mut d = dst.chunks_exact_mut(8);
    let mut s = src.chunks_exact(8);
    for (dc, sc) in (&mut d).zip(&mut s) {
        let mut a = [0u8; 8];
        let mut b = [0u8; 8];
        a.copy_from_slice(dc);
        b.copy_from_slice(sc);
        dc.copy_from_slice(&(u64::from_ne_bytes(a) ^ u64::from_ne_bytes(b)).to_ne_bytes());
    }
    for (x, y) in d.into_remainder().iter_mut().zip(s.remainder()) {
        *x ^= *y;
    }
}

/// `dst[i] ^= src[i] * coeff` in GF(2^8). Slices must have equal length.
#[inline]
pub fn mul_add_into(dst: &mut [u8], src: &[u8], coeff: u8) {
    debug_assert_eq!(dst.len(), src.len());
    match coeff {
        0 => return,
        1 => {
            xor_into(dst, src);
            return;
        }
        _ => {}
    }
    let n = dst.len().min(src.len());
    let (dst, src) = (&mut dst[..n], &src[..n]);

    #[cfg(all(feature = "simd", target_arch = "x86_64"))]
    {
        if std::is_x86_feature_detected!("ssse3") {
            unsafe { simd_x86::mul_add_ssse3(dst, src, coeff) };
            return;
        }
    }

    #[cfg(all(feature = "simd", target_arch = "aarch64"))]
    {
        unsafe { simd_neon::mul_add_neon(dst, src, coeff) };
        return;
    }

    #[cfg(not(all(feature = "simd", target_arch = "aarch64")))]
    {
        mul_add_into_scalar(dst, src, coeff);
    }
}

/// Portable version of [`mul_add_into`].
pub fn mul_add_into_scalar(dst: &mut [u8], src: &[u8], coeff: u8) {
    debug_assert_eq!(dst.len(), src.len());
    if coeff == 0 {
        return;
    }
    let table = MUL_TABLES.get(coeff);
    for (x, y) in dst.iter_mut().zip(src) {
        *x ^= table[*y as usize];
    }
}

/// `dst[i] *= coeff` in GF(2^8).
pub fn mul_in_place(dst: &mut [u8], coeff: u8) {
    match coeff {
        0 => dst.fill(0),
        1 => {}
        _ => {
            let table = MUL_TABLES.get(coeff);
            for x in dst.iter_mut() {
                *x = table[*x as usize];
            }
        }
    }
}
