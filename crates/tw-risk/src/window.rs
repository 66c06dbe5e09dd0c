use std::collections::{HashMap, VecDeque};

use tw_types::InstrumentId;

/// Per-snapshot instrument marks.
pub type Marks = HashMap<InstrumentId, f64>;

/// Rolling window of the last `capacity` snapshot marks. The portfolio value
/// series is revalued from these marks with the current holdings, so the
/// window answers "what would today's book have done over the window".
#[derive(Debug)]
pub struct MarkWindow {
    marks: VecDeque<Marks>,
    capacity: usize,
}

impl MarkWindow {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(2);
        Self {
            marks: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Appends the newest marks, evicting the oldest when full.
    pub fn push(&mut self, marks: Marks) {
        if self.marks.len() == self.capacity {
            self.marks.pop_front();
        }
        self.marks.push_back(marks);
    }

    pub fn len(&self) -> usize {
        self.marks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.marks.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.marks.len() == self.capacity
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Writes the value of `holdings` at every mark in the window into `out`,
    /// oldest first. An instrument without a mark at some point is valued at
    /// `fallback` (the current mark).
    pub fn revalue(&self, holdings: &[(InstrumentId, f64)], fallback: &Marks, out: &mut Vec<f64>) {
        out.clear();
        for marks in &self.marks {
            let mut value = 0.0;
            for (id, qty) in holdings {
                if let Some(px) = marks.get(id).or_else(|| fallback.get(id)) {
                    value += qty * px;
                }
            }
            out.push(value);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn marks(px: f64) -> Marks {
        HashMap::from([("AAA".to_string(), px)])
    }

    #[test]
    fn evicts_oldest_at_capacity() {
        let mut w = MarkWindow::new(3);
        for px in [1.0, 2.0, 3.0, 4.0] {
            w.push(marks(px));
        }
        assert!(w.is_full());
        let mut out = Vec::new();
        w.revalue(&[("AAA".to_string(), 10.0)], &marks(4.0), &mut out);
        assert_eq!(out, vec![20.0, 30.0, 40.0]);
    }

    #[test]
    fn missing_marks_use_fallback() {
        let mut w = MarkWindow::new(4);
        w.push(HashMap::new());
        w.push(marks(5.0));
        let mut out = Vec::new();
        w.revalue(&[("AAA".to_string(), 2.0)], &marks(5.0), &mut out);
        assert_eq!(out, vec![10.0, 10.0]);
    }
}
