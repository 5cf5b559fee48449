use blake3;
use std::hash::{Hash, Hasher};

pub trait DigestHasher {
    fn input<I: Hash>(&mut self, input: I);

    /// Feeds a length-prefixed byte string so adjacent inputs can't run into
    /// each other.
    fn input_bytes(&mut self, bytes: &[u8]);
}

impl DigestHasher for blake3::Hasher {
    fn input<I: Hash>(&mut self, input: I) {
        struct StdHasher<'a>(&'a mut blake3::Hasher);

        impl<'a> Hasher for StdHasher<'a> {
            fn finish(&self) -> u64 {
                panic!();
            }

            fn write(&mut self, bytes: &[u8]) {
                self.0.update(bytes);
            }
        }

        input.hash(&mut StdHasher(self))
    }

    fn input_bytes(&mut self, bytes: &[u8]) {
        self.update(&(bytes.len() as u64).to_le_bytes());
        self.update(bytes);
    }
}
