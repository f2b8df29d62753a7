//! C3 — fountain codec (spec §4.2, §3 "Fountain combination").
//!
//! A rateless GF(2) (plain XOR) erasure code. The source splits a byte
//! range into fixed-size symbols ("components") and emits random linear
//! combinations over a sliding window; the sink performs incremental
//! Gaussian elimination in echelon form and reports decode progress.
//!
//! GF(2) is used instead of a larger field because codec throughput must
//! dominate cryptographic hashing (spec §4.2) — XOR is branch-free and
//! vectorizes trivially, at the cost of a higher redundancy factor to keep
//! the probability of linearly-dependent combinations low; the handler's
//! `redundancy` parameter (§4.6) compensates.

use thiserror::Error;

/// Size of one fountain component (symbol). Not specified by the protocol
/// document at the byte level; chosen to comfortably fit one coded
/// combination inside a single link frame/datagram (§4.6 `data_size: u16`)
/// while keeping per-block component counts reasonable for `B ≈ 256 KiB`
/// blocks. See DESIGN.md for this as a resolved open question.
pub const SYMBOL_SIZE: usize = 1024;

/// Maximum number of components a single combination's window may span.
/// Bounds coefficient-bitset size and gives the source room to diversify
/// combinations without windows growing unboundedly as blocks get larger.
const MAX_WINDOW: usize = 32;

#[derive(Debug, Error)]
pub enum FountainError {
    #[error("empty source (zero components)")]
    EmptySource,
    #[error("combination window is invalid (first > last, or out of range)")]
    InvalidWindow,
    #[error("sink is not fully decoded")]
    NotDecoded,
}

fn component_count(len: usize) -> usize {
    (len + SYMBOL_SIZE - 1) / SYMBOL_SIZE
}

fn symbol_at(bytes: &[u8], index: usize) -> [u8; SYMBOL_SIZE] {
    let mut symbol = [0u8; SYMBOL_SIZE];
    let start = index * SYMBOL_SIZE;
    if start < bytes.len() {
        let end = (start + SYMBOL_SIZE).min(bytes.len());
        symbol[..end - start].copy_from_slice(&bytes[start..end]);
    }
    symbol
}

fn xor_into(dst: &mut [u8; SYMBOL_SIZE], src: &[u8; SYMBOL_SIZE]) {
    for i in 0..SYMBOL_SIZE {
        dst[i] ^= src[i];
    }
}

/// A GF(2)-linear combination of source components plus its coded payload.
/// `total_length` piggybacks the original byte length on the first
/// combination of a transfer so the sink can truncate on decode (spec §4.1
/// "the exact original length is known from the combination header").
#[derive(Clone, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct Combination {
    pub first_component: u32,
    pub last_component: u32,
    /// One bit per component in `[first_component, last_component]`.
    pub coefficients: Vec<bool>,
    pub total_length: u64,
    pub payload: Vec<u8>,
}

impl Combination {
    pub fn is_null(&self) -> bool {
        self.coefficients.iter().all(|b| !*b)
    }

    pub fn window_len(&self) -> usize {
        (self.last_component - self.first_component + 1) as usize
    }
}

/// Encodes random combinations over a fixed byte range.
pub struct FountainSource {
    bytes: Vec<u8>,
    /// Lowest component index still eligible for inclusion (advances as the
    /// peer acknowledges decode progress via `drop`).
    first_component: u32,
    total_components: u32,
}

impl FountainSource {
    pub fn new(bytes: Vec<u8>) -> Result<Self, FountainError> {
        let total_components = component_count(bytes.len()).max(1) as u32;
        Ok(FountainSource { bytes, first_component: 0, total_components })
    }

    /// Number of components from `first_component` to the end — the
    /// quantity the congestion controller calls `rank(source)` (spec §4.6).
    pub fn rank(&self) -> u32 {
        self.total_components.saturating_sub(self.first_component)
    }

    pub fn total_components(&self) -> u32 {
        self.total_components
    }

    /// Prune components below `first_component`; the peer has decoded them
    /// and they need not be encoded again.
    pub fn drop_below(&mut self, first_component: u32) {
        self.first_component = self.first_component.max(first_component).min(self.total_components);
    }

    /// Generate one random combination over the active window.
    pub fn generate(&self) -> Result<Combination, FountainError> {
        if self.total_components == 0 {
            return Err(FountainError::EmptySource);
        }
        let remaining = self.total_components - self.first_component;
        if remaining == 0 {
            // Nothing left to encode; emit a null (all-zero) combination over
            // a single-component window so the peer can still ack/keepalive.
            return Ok(Combination {
                first_component: self.first_component.saturating_sub(1),
                last_component: self.first_component.saturating_sub(1),
                coefficients: vec![false],
                total_length: self.bytes.len() as u64,
                payload: vec![0u8; SYMBOL_SIZE],
            });
        }

        let window = (crypto_rand_range(1, remaining.min(MAX_WINDOW as u32) + 1)).max(1);
        let first = self.first_component;
        let last = first + window - 1;

        let mut coefficients = Vec::with_capacity(window as usize);
        let mut payload = [0u8; SYMBOL_SIZE];
        let mut any = false;
        for offset in 0..window {
            let bit = crypto_rand_bit();
            coefficients.push(bit);
            if bit {
                any = true;
                let symbol = symbol_at(&self.bytes, (first + offset) as usize);
                xor_into(&mut payload, &symbol);
            }
        }
        if !any {
            // Force at least one active component so the combination carries
            // information; pick the first one in the window.
            coefficients[0] = true;
            let symbol = symbol_at(&self.bytes, first as usize);
            xor_into(&mut payload, &symbol);
        }

        Ok(Combination {
            first_component: first,
            last_component: last,
            coefficients,
            total_length: self.bytes.len() as u64,
            payload: payload.to_vec(),
        })
    }
}

fn crypto_rand_range(lo: u32, hi_exclusive: u32) -> u32 {
    if hi_exclusive <= lo {
        return lo;
    }
    lo + (crate::crypto::random_bytes(4)
        .iter()
        .fold(0u32, |acc, b| (acc << 8) | *b as u32)
        % (hi_exclusive - lo))
}

fn crypto_rand_bit() -> bool {
    crate::crypto::random_bytes(1)[0] & 1 == 1
}

/// One row of the sink's echelon-form matrix: a bitset of coefficients
/// aligned at `leading` (the column of its pivot bit) plus the XORed payload.
#[derive(Clone, Debug)]
struct Row {
    leading: u32,
    /// Coefficients for columns `[leading, leading + bits.len())`.
    bits: Vec<bool>,
    payload: [u8; SYMBOL_SIZE],
}

/// Decodes a block from a stream of [`Combination`]s via incremental
/// Gaussian elimination.
pub struct FountainSink {
    first_component: u32,
    /// One past the highest component index seen in any combination so far.
    next_seen: u32,
    rows: Vec<Row>,
    solved: std::collections::BTreeMap<u32, [u8; SYMBOL_SIZE]>,
    total_length: Option<u64>,
}

impl Default for FountainSink {
    fn default() -> Self {
        Self::new()
    }
}

impl FountainSink {
    pub fn new() -> Self {
        FountainSink {
            first_component: 0,
            next_seen: 0,
            rows: Vec::new(),
            solved: std::collections::BTreeMap::new(),
            total_length: None,
        }
    }

    /// Lowest component not yet solved.
    pub fn next_decoded(&self) -> u32 {
        let mut i = self.first_component;
        while self.solved.contains_key(&i) {
            i += 1;
        }
        i
    }

    pub fn next_seen(&self) -> u32 {
        self.next_seen
    }

    /// Number of linearly independent rows currently held (the sink's rank).
    pub fn rank(&self) -> u32 {
        self.rows.len() as u32 + self.solved.len() as u32
    }

    /// Components still required to fully decode, or `None` if the total
    /// component count is not yet knowable (no combination received yet).
    pub fn missing(&self) -> Option<u32> {
        let total = self.total_length.map(component_count)? as u32;
        Some(total.saturating_sub(self.rank().min(total)))
    }

    pub fn decoded(&self) -> bool {
        match self.total_length.map(component_count) {
            Some(total) => (0..total as u32).all(|i| self.solved.contains_key(&i)),
            None => false,
        }
    }

    /// Drop components below `first_component`: they are already decoded and
    /// the source won't re-send them (spec §4.2 `drop(first_component)`).
    pub fn drop_below(&mut self, first_component: u32) {
        self.first_component = self.first_component.max(first_component);
    }

    /// Incorporate one combination, performing echelon reduction. Returns
    /// `true` if the block is now fully decoded.
    pub fn push(&mut self, combination: &Combination) -> Result<bool, FountainError> {
        if combination.last_component < combination.first_component {
            return Err(FountainError::InvalidWindow);
        }
        self.total_length.get_or_insert(combination.total_length);
        self.next_seen = self.next_seen.max(combination.last_component + 1);

        if combination.is_null() {
            return Ok(self.decoded());
        }

        let mut leading = combination.first_component;
        let mut bits = combination.coefficients.clone();
        let mut payload: [u8; SYMBOL_SIZE] = combination
            .payload
            .as_slice()
            .try_into()
            .unwrap_or([0u8; SYMBOL_SIZE]);

        // Strip already-solved leading columns by substituting known values.
        loop {
            while !bits.is_empty() && !bits[0] {
                bits.remove(0);
                leading += 1;
            }
            if bits.is_empty() {
                return Ok(self.decoded());
            }
            if let Some(known) = self.solved.get(&leading) {
                xor_into(&mut payload, known);
                bits[0] = false;
                continue;
            }
            break;
        }

        // Reduce against existing rows in echelon form.
        let mut row = Row { leading, bits, payload };
        loop {
            let pivot = self.rows.iter().find(|r| r.leading == row.leading).cloned();
            match pivot {
                Some(existing) => {
                    reduce_row_against(&mut row, &existing);
                    if row.bits.iter().all(|b| !*b) {
                        return Ok(self.decoded());
                    }
                    // Re-normalize leading index after reduction.
                    while !row.bits.is_empty() && !row.bits[0] {
                        row.bits.remove(0);
                        row.leading += 1;
                    }
                }
                None => break,
            }
        }

        if row.bits.len() == 1 {
            // Fully solved column.
            self.solved.insert(row.leading, row.payload);
            self.back_substitute(row.leading, &row.payload);
        } else {
            self.rows.push(row);
            self.try_solve_rows();
        }

        Ok(self.decoded())
    }

    fn back_substitute(&mut self, column: u32, value: &[u8; SYMBOL_SIZE]) {
        let mut newly_solved = Vec::new();
        for r in self.rows.iter_mut() {
            if let Some(pos) = col_position(r, column) {
                if r.bits[pos] {
                    r.bits[pos] = false;
                    xor_into(&mut r.payload, value);
                }
            }
        }
        self.rows.retain_mut(|r| {
            while !r.bits.is_empty() && !r.bits[0] {
                r.bits.remove(0);
                r.leading += 1;
            }
            if r.bits.len() == 1 {
                newly_solved.push((r.leading, r.payload));
                false
            } else {
                !r.bits.is_empty()
            }
        });
        for (col, val) in newly_solved {
            self.solved.insert(col, val);
            self.back_substitute(col, &val);
        }
    }

    fn try_solve_rows(&mut self) {
        let mut progressed = true;
        while progressed {
            progressed = false;
            if let Some(pos) = self.rows.iter().position(|r| r.bits.len() == 1) {
                let r = self.rows.remove(pos);
                self.solved.insert(r.leading, r.payload);
                self.back_substitute(r.leading, &r.payload);
                progressed = true;
            }
        }
    }

    /// Reconstruct the decoded bytes, truncated to the original length.
    pub fn dump(&self) -> Result<Vec<u8>, FountainError> {
        if !self.decoded() {
            return Err(FountainError::NotDecoded);
        }
        let total_len = self.total_length.unwrap_or(0) as usize;
        let total = component_count(total_len);
        let mut out = Vec::with_capacity(total * SYMBOL_SIZE);
        for i in 0..total as u32 {
            out.extend_from_slice(self.solved.get(&i).expect("decoded implies all solved"));
        }
        out.truncate(total_len);
        Ok(out)
    }
}

fn col_position(row: &Row, column: u32) -> Option<usize> {
    if column < row.leading {
        return None;
    }
    let offset = (column - row.leading) as usize;
    if offset < row.bits.len() {
        Some(offset)
    } else {
        None
    }
}

fn reduce_row_against(row: &mut Row, pivot: &Row) {
    debug_assert_eq!(row.leading, pivot.leading);
    let len = row.bits.len().max(pivot.bits.len());
    row.bits.resize(len, false);
    for i in 0..pivot.bits.len() {
        if pivot.bits[i] {
            row.bits[i] = !row.bits[i];
        }
    }
    xor_into(&mut row.payload, &pivot.payload);
    while !row.bits.is_empty() && !row.bits[0] {
        row.bits.remove(0);
        row.leading += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decode_all(data: &[u8]) -> Vec<u8> {
        let source = FountainSource::new(data.to_vec()).unwrap();
        let mut sink = FountainSink::new();
        let mut attempts = 0;
        while !sink.decoded() {
            let combo = source.generate().unwrap();
            sink.push(&combo).unwrap();
            attempts += 1;
            assert!(attempts < 100_000, "decode did not converge");
        }
        sink.dump().unwrap()
    }

    #[test]
    fn roundtrip_small_payload() {
        let data = b"hello world".repeat(1);
        assert_eq!(decode_all(&data), data);
    }

    #[test]
    fn roundtrip_multi_symbol_payload() {
        let data: Vec<u8> = (0..(SYMBOL_SIZE * 5 + 37)).map(|i| (i % 251) as u8).collect();
        assert_eq!(decode_all(&data), data);
    }

    #[test]
    fn roundtrip_empty_payload() {
        let data: Vec<u8> = vec![];
        assert_eq!(decode_all(&data), data);
    }

    #[test]
    fn roundtrip_exact_multiple_of_symbol_size() {
        let data: Vec<u8> = (0..(SYMBOL_SIZE * 3)).map(|i| (i % 200) as u8).collect();
        assert_eq!(decode_all(&data), data);
    }

    #[test]
    fn missing_decreases_towards_zero() {
        let source = FountainSource::new(vec![1u8; SYMBOL_SIZE * 4]).unwrap();
        let mut sink = FountainSink::new();
        let mut last_missing = u32::MAX;
        for _ in 0..200 {
            if sink.decoded() {
                break;
            }
            let combo = source.generate().unwrap();
            sink.push(&combo).unwrap();
            if let Some(m) = sink.missing() {
                assert!(m <= last_missing);
                last_missing = m;
            }
        }
        assert_eq!(sink.missing(), Some(0));
    }
}
