/// Adler-32 style weak checksum over a sliding window.
///
/// Two 16-bit sums (a, b) packed into one `u32`. Sliding the window by one byte
/// is O(1), which is what makes scanning every offset of the target affordable.
const MOD_ADLER: u32 = 65521;

#[derive(Debug, Clone, Copy)]
pub struct WeakSum {
    a: u32,
    b: u32,
    len: u32,
}

impl WeakSum {
    /// Checksum of a complete window.
    pub fn of(window: &[u8]) -> Self {
        // u64 accumulators: reduce once at the end instead of per byte.
        let mut a: u64 = 1;
        let mut b: u64 = 0;
        for &byte in window {
            a += byte as u64;
            b += a;
        }
        Self {
            a: (a % MOD_ADLER as u64) as u32,
            b: (b % MOD_ADLER as u64) as u32,
            len: window.len() as u32,
        }
    }

    /// Drop `outgoing` from the front of the window and append `incoming`.
    pub fn roll(&mut self, outgoing: u8, incoming: u8) {
        let out = outgoing as u32;
        let inc = incoming as u32;
        let len = self.len % MOD_ADLER;

        self.a = (self.a + MOD_ADLER - out + inc) % MOD_ADLER;
        let dropped = (out * len) % MOD_ADLER;
        self.b = (self.b + self.a + 2 * MOD_ADLER - 1 - dropped) % MOD_ADLER;
    }

    pub fn value(&self) -> u32 {
        (self.b << 16) | self.a
    }
}
