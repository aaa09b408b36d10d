// Incremental UTF-8 validation for fragmented text messages.
//
// A text message may be split across any number of frames, and a frame
// boundary may fall in the middle of a multi-byte sequence. `Utf8Validator`
// is a byte-at-a-time DFA (Bjoern Hoehrmann's decoder table) whose state is
// carried from one fragment to the next. A message is valid only if the DFA
// never rejects and ends in the accept state after the final fragment.
//
// Close-frame reasons are validated in one shot with `is_valid_utf8`.

const ACCEPT: u8 = 0;
const REJECT: u8 = 1;

// First 256 entries map a byte to its character class; the remaining 9x16
// entries map (state, class) to the next state.
#[rustfmt::skip]
const UTF8D: [u8; 400] = [
    0,0,0,0,0,0,0,0,0,0,0,0,0,0,0,0,0,0,0,0,0,0,0,0,0,0,0,0,0,0,0,0, // 00..1f
    0,0,0,0,0,0,0,0,0,0,0,0,0,0,0,0,0,0,0,0,0,0,0,0,0,0,0,0,0,0,0,0, // 20..3f
    0,0,0,0,0,0,0,0,0,0,0,0,0,0,0,0,0,0,0,0,0,0,0,0,0,0,0,0,0,0,0,0, // 40..5f
    0,0,0,0,0,0,0,0,0,0,0,0,0,0,0,0,0,0,0,0,0,0,0,0,0,0,0,0,0,0,0,0, // 60..7f
    1,1,1,1,1,1,1,1,1,1,1,1,1,1,1,1,9,9,9,9,9,9,9,9,9,9,9,9,9,9,9,9, // 80..9f
    7,7,7,7,7,7,7,7,7,7,7,7,7,7,7,7,7,7,7,7,7,7,7,7,7,7,7,7,7,7,7,7, // a0..bf
    8,8,2,2,2,2,2,2,2,2,2,2,2,2,2,2,2,2,2,2,2,2,2,2,2,2,2,2,2,2,2,2, // c0..df
    10,3,3,3,3,3,3,3,3,3,3,3,3,4,3,3,                                 // e0..ef
    11,6,6,6,5,8,8,8,8,8,8,8,8,8,8,8,                                 // f0..ff
    0,1,2,3,5,8,7,1,1,1,4,6,1,1,1,1,                                  // s0
    1,1,1,1,1,1,1,1,1,1,1,1,1,1,1,1,1,0,1,1,1,1,1,0,1,0,1,1,1,1,1,1,  // s1..s2
    1,2,1,1,1,1,1,2,1,2,1,1,1,1,1,1,1,1,1,1,1,1,1,2,1,1,1,1,1,1,1,1,  // s3..s4
    1,2,1,1,1,1,1,1,1,2,1,1,1,1,1,1,1,1,1,1,1,1,1,3,1,3,1,1,1,1,1,1,  // s5..s6
    1,3,1,1,1,1,1,3,1,3,1,1,1,1,1,1,1,3,1,1,1,1,1,1,1,1,1,1,1,1,1,1,  // s7..s8
];

/// Streaming UTF-8 validator whose state survives across fragments.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Utf8Validator {
    state: u8,
}

impl Utf8Validator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed another chunk. Returns `false` as soon as the input can no
    /// longer be valid UTF-8, regardless of what follows.
    pub fn feed(&mut self, bytes: &[u8]) -> bool {
        for &byte in bytes {
            let class = UTF8D[byte as usize];
            self.state = UTF8D[256 + self.state as usize * 16 + class as usize];
            if self.state == REJECT {
                return false;
            }
        }
        true
    }

    /// True if everything fed so far forms complete, valid UTF-8.
    pub fn is_complete(&self) -> bool {
        self.state == ACCEPT
    }

    pub fn is_rejected(&self) -> bool {
        self.state == REJECT
    }

    pub fn reset(&mut self) {
        self.state = ACCEPT;
    }
}

/// Validate a complete buffer in one pass.
pub fn is_valid_utf8(bytes: &[u8]) -> bool {
    let mut validator = Utf8Validator::new();
    validator.feed(bytes) && validator.is_complete()
}
