//! Cyclic enumeration of fixed-size combinations.

use parking_lot::Mutex;

/// Shared generator of `size`-element combinations of a source sequence.
///
/// Combinations are produced in lexicographic order of source *indices*, so a
/// source with repeated values yields repeated combinations by value. The
/// enumeration state sits behind one lock: concurrent callers each receive a
/// distinct next element of the same logical sequence.
pub struct Combinations<T> {
    source: Vec<T>,
    size: usize,
    cursor: Mutex<Cursor>,
}

/// Explicit index stack replacing recursion.
///
/// `stack[i]` holds the next source index to try at position `i`; `picks`
/// holds the indices of the combination being assembled.
struct Cursor {
    stack: Vec<usize>,
    picks: Vec<usize>,
}

impl Cursor {
    fn new(size: usize) -> Self {
        Self {
            stack: vec![0],
            picks: vec![0; size],
        }
    }

    fn advance(&mut self, n: usize) -> bool {
        let k = self.picks.len();
        while let Some(mut j) = self.stack.pop() {
            let mut i = self.stack.len();
            while j < n {
                self.picks[i] = j;
                j += 1;
                self.stack.push(j);
                i += 1;
                if i == k {
                    return true;
                }
            }
        }
        false
    }
}

impl<T: Clone> Combinations<T> {
    /// Create a generator over `source` producing combinations of `size` elements.
    ///
    /// A generator with `size == 0` or `size > source.len()` never yields.
    pub fn new(source: Vec<T>, size: usize) -> Self {
        Self {
            source,
            size,
            cursor: Mutex::new(Cursor::new(size)),
        }
    }

    /// Return the next combination, or `None` once all `C(n, size)` were produced.
    pub fn next(&self) -> Option<Vec<T>> {
        let mut cursor = self.cursor.lock();
        self.next_locked(&mut cursor)
    }

    /// Return the next combination, restarting the enumeration when exhausted.
    ///
    /// Always yields when `0 < size <= n`.
    pub fn next_wrap(&self) -> Option<Vec<T>> {
        let mut cursor = self.cursor.lock();
        if let Some(combination) = self.next_locked(&mut cursor) {
            return Some(combination);
        }
        *cursor = Cursor::new(self.size);
        self.next_locked(&mut cursor)
    }

    fn next_locked(&self, cursor: &mut Cursor) -> Option<Vec<T>> {
        if self.size == 0 || self.size > self.source.len() {
            return None;
        }
        if !cursor.advance(self.source.len()) {
            return None;
        }
        Some(
            cursor
                .picks
                .iter()
                .map(|&index| self.source[index].clone())
                .collect(),
        )
    }
}
