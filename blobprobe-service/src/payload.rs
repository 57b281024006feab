//! Random image payloads and their fingerprints.
//!
//! Every payload is an uncompressed 24-bit BMP image filled with random pixels. The pixels
//! come from a [`SmallRng`] seeded per payload, so every run uploads distinct content that
//! no caching layer can serve. The seed is logged, which allows reproducing the exact bytes
//! of a run.
//!
//! A BMP file is a fixed header followed by rows padded to four bytes. This makes its size
//! predictable, so image dimensions are chosen to fill the drawn size as closely as
//! possible without exceeding it.

use std::fmt;
use std::num::NonZeroU64;

use bytes::Bytes;
use image::codecs::bmp::BmpEncoder;
use image::{ExtendedColorType, ImageEncoder};
use rand::rngs::SmallRng;
use rand::{Rng, RngCore, SeedableRng};
use sha2::{Digest, Sha256};

/// Default upper bound for payload sizes: 5 MiB.
pub const DEFAULT_MAX_SIZE: NonZeroU64 = NonZeroU64::new(5 * 1024 * 1024).unwrap();

/// Size of the smallest payload, a single pixel image.
pub const MIN_SIZE: NonZeroU64 = NonZeroU64::new(HEADER_LEN + 4).unwrap();

/// Largest supported payload size: 1 GiB.
pub const MAX_SIZE: NonZeroU64 = NonZeroU64::new(1024 * 1024 * 1024).unwrap();

/// Media type of generated payloads.
pub const CONTENT_TYPE: &str = "image/bmp";

/// File header and `BITMAPINFOHEADER` of a 24-bit BMP.
const HEADER_LEN: u64 = 14 + 40;

fn row_len(width: u64) -> u64 {
    (3 * width).next_multiple_of(4)
}

/// Picks the dimensions of an image that fills `budget` bytes without exceeding it.
///
/// The aspect ratio varies randomly between 1:2 and 2:1.
fn dimensions(rng: &mut SmallRng, budget: u64) -> (u32, u32) {
    let data = budget - HEADER_LEN;
    let pixels = data / 3;
    let aspect: f64 = rng.random_range(0.5..=2.0);

    let mut width = ((pixels as f64 * aspect).sqrt() as u64).clamp(1, pixels.max(1));
    while row_len(width) > data {
        width -= 1;
    }
    let height = data / row_len(width);

    (width as u32, height as u32)
}

fn encode_bmp(pixels: &[u8], width: u32, height: u32) -> Vec<u8> {
    let len = HEADER_LEN + row_len(width.into()) * u64::from(height);
    let mut buffer = Vec::with_capacity(len as usize);
    BmpEncoder::new(&mut buffer)
        .write_image(pixels, width, height, ExtendedColorType::Rgb8)
        .expect("images within MAX_SIZE always encode");
    buffer
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum SizeDistribution {
    Uniform(NonZeroU64),
    Fixed(NonZeroU64),
}

/// Creates random images of bounded size.
///
/// Sizes are clamped to [`MIN_SIZE`] and [`MAX_SIZE`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PayloadGenerator {
    sizes: SizeDistribution,
}

impl PayloadGenerator {
    /// Draws sizes uniformly from `MIN_SIZE..=max_size` bytes.
    pub fn uniform(max_size: NonZeroU64) -> Self {
        Self {
            sizes: SizeDistribution::Uniform(max_size),
        }
    }

    /// Generates images that fill `size` bytes as closely as possible.
    pub fn fixed(size: NonZeroU64) -> Self {
        Self {
            sizes: SizeDistribution::Fixed(size),
        }
    }

    /// The largest payload this generator creates.
    pub fn max_size(&self) -> NonZeroU64 {
        match self.sizes {
            SizeDistribution::Uniform(size) | SizeDistribution::Fixed(size) => {
                size.clamp(MIN_SIZE, MAX_SIZE)
            }
        }
    }

    /// Generates a payload from a random seed.
    pub fn generate(&self) -> Payload {
        self.generate_from_seed(rand::random())
    }

    /// Generates the payload for `seed`. Equal seeds yield equal payloads.
    pub fn generate_from_seed(&self, seed: u64) -> Payload {
        let mut rng = SmallRng::seed_from_u64(seed);
        let max = self.max_size().get();
        let budget = match self.sizes {
            SizeDistribution::Uniform(_) => rng.random_range(MIN_SIZE.get()..=max),
            SizeDistribution::Fixed(_) => max,
        };

        let (width, height) = dimensions(&mut rng, budget);
        let mut pixels = vec![0; width as usize * height as usize * 3];
        rng.fill_bytes(&mut pixels);

        let bytes = encode_bmp(&pixels, width, height);
        let fingerprint = PayloadFingerprint::of(&bytes);

        Payload {
            bytes: bytes.into(),
            seed,
            dimensions: (width, height),
            fingerprint,
        }
    }
}

impl Default for PayloadGenerator {
    fn default() -> Self {
        Self::uniform(DEFAULT_MAX_SIZE)
    }
}

/// A random image, the contents of a test blob.
#[derive(Clone)]
pub struct Payload {
    bytes: Bytes,
    seed: u64,
    dimensions: (u32, u32),
    fingerprint: PayloadFingerprint,
}

impl Payload {
    /// The payload bytes.
    pub fn bytes(&self) -> &Bytes {
        &self.bytes
    }

    /// The seed the bytes were generated from.
    pub fn seed(&self) -> u64 {
        self.seed
    }

    /// Width and height of the image in pixels.
    pub fn dimensions(&self) -> (u32, u32) {
        self.dimensions
    }

    /// Size and digest of the payload.
    pub fn fingerprint(&self) -> PayloadFingerprint {
        self.fingerprint
    }

    /// Splits the payload into its bytes and fingerprint.
    ///
    /// The bytes can be handed off to an upload while the fingerprint is retained for
    /// verification, so the payload is not held in memory twice.
    pub fn into_parts(self) -> (Bytes, PayloadFingerprint) {
        (self.bytes, self.fingerprint)
    }
}

impl fmt::Debug for Payload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Payload")
            .field("seed", &self.seed)
            .field("dimensions", &self.dimensions)
            .field("fingerprint", &self.fingerprint)
            .finish_non_exhaustive()
    }
}

/// Size and SHA-256 digest of a payload.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PayloadFingerprint {
    len: u64,
    digest: [u8; 32],
}

impl PayloadFingerprint {
    /// Computes the fingerprint of `bytes`.
    pub fn of(bytes: &[u8]) -> Self {
        Self {
            len: bytes.len() as u64,
            digest: Sha256::digest(bytes).into(),
        }
    }

    /// The payload size in bytes.
    pub fn len(&self) -> u64 {
        self.len
    }

    /// Returns `true` for an empty payload.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// The raw SHA-256 digest.
    pub fn digest(&self) -> &[u8; 32] {
        &self.digest
    }

    /// The SHA-256 digest as lowercase hex string.
    pub fn hex_digest(&self) -> String {
        hex::encode(self.digest)
    }
}

impl fmt::Display for PayloadFingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} bytes, sha256:{}", self.len, self.hex_digest())
    }
}

#[cfg(test)]
mod tests {
    use image::ImageFormat;

    use super::*;

    fn size(bytes: u64) -> NonZeroU64 {
        NonZeroU64::new(bytes).unwrap()
    }

    #[test]
    fn sizes_stay_within_bounds() {
        let generator = PayloadGenerator::uniform(size(4096));

        for seed in 0..500 {
            let payload = generator.generate_from_seed(seed);
            let len = payload.fingerprint().len();
            assert!(len >= MIN_SIZE.get() && len <= 4096, "size {len} out of bounds");
            assert_eq!(payload.bytes().len() as u64, len);
        }
    }

    #[test]
    fn smallest_bound_yields_single_pixel() {
        let payload = PayloadGenerator::uniform(size(1)).generate();
        assert_eq!(payload.dimensions(), (1, 1));
        assert_eq!(payload.bytes().len() as u64, MIN_SIZE.get());
    }

    #[test]
    fn fixed_size_is_filled() {
        let payload = PayloadGenerator::fixed(size(2_000_000)).generate();
        let len = payload.bytes().len() as u64;
        let (width, _) = payload.dimensions();

        assert!(len <= 2_000_000);
        assert!(2_000_000 - len < row_len(width.into()));
    }

    #[test]
    fn payload_is_a_bmp_image() {
        let payload = PayloadGenerator::uniform(size(64 * 1024)).generate_from_seed(3);

        assert_eq!(image::guess_format(payload.bytes()).unwrap(), ImageFormat::Bmp);
        let image = image::load_from_memory_with_format(payload.bytes(), ImageFormat::Bmp)
            .unwrap()
            .to_rgb8();
        assert_eq!(image.dimensions(), payload.dimensions());
    }

    #[test]
    fn aspect_ratio_is_bounded() {
        let generator = PayloadGenerator::fixed(size(1024 * 1024));

        for seed in 0..50 {
            let (width, height) = generator.generate_from_seed(seed).dimensions();
            let ratio = f64::from(width) / f64::from(height);
            assert!((0.45..=2.1).contains(&ratio), "{width}x{height}");
        }
    }

    #[test]
    fn seeded_generation_is_deterministic() {
        let generator = PayloadGenerator::uniform(size(64 * 1024));

        let first = generator.generate_from_seed(42);
        let second = generator.generate_from_seed(42);
        let other = generator.generate_from_seed(43);

        assert_eq!(first.bytes(), second.bytes());
        assert_eq!(first.fingerprint(), second.fingerprint());
        assert_ne!(first.fingerprint(), other.fingerprint());
    }

    #[test]
    fn fingerprint_matches_content() {
        let payload = PayloadGenerator::fixed(size(1024)).generate_from_seed(7);
        let (bytes, fingerprint) = payload.into_parts();

        assert_eq!(fingerprint, PayloadFingerprint::of(&bytes));
        assert_eq!(fingerprint.hex_digest().len(), 64);
        assert!(
            fingerprint
                .to_string()
                .starts_with(&format!("{} bytes, sha256:", bytes.len()))
        );
    }

    #[test]
    fn known_digest() {
        let fingerprint = PayloadFingerprint::of(b"abc");
        assert_eq!(
            fingerprint.hex_digest(),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }
}
