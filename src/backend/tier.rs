// Tiered requirements
//
// Every negotiable property carries a required tier (hard floor) and a
// requested tier (what we would like). Setters keep required <= requested.

/// Scalar requirement with a required floor and a requested target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Tiered<T> {
    required: T,
    requested: T,
}

impl<T: Ord + Copy> Tiered<T> {
    pub fn new(value: T) -> Self {
        Self {
            required: value,
            requested: value,
        }
    }

    pub fn required(&self) -> T {
        self.required
    }

    pub fn requested(&self) -> T {
        self.requested
    }

    /// Raise (or lower) the floor; the requested tier is pulled up to match.
    pub fn require(&mut self, value: T) {
        self.required = value;
        if self.requested < value {
            self.requested = value;
        }
    }

    /// Change the target; the floor is pulled down to match.
    pub fn request(&mut self, value: T) {
        self.requested = value;
        if value < self.required {
            self.required = value;
        }
    }

    pub fn with_required(mut self, value: T) -> Self {
        self.require(value);
        self
    }

    pub fn with_requested(mut self, value: T) -> Self {
        self.request(value);
        self
    }
}

impl<T: Ord + Copy + Default> Default for Tiered<T> {
    fn default() -> Self {
        Self::new(T::default())
    }
}

/// Set-like requirement (extensions, layers). Items are unique per tier and
/// an item that becomes required is dropped from the requested tier.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TieredList<T> {
    required: Vec<T>,
    requested: Vec<T>,
}

impl<T> Default for TieredList<T> {
    fn default() -> Self {
        Self {
            required: Vec::new(),
            requested: Vec::new(),
        }
    }
}

impl<T: PartialEq> TieredList<T> {
    pub fn required(&self) -> &[T] {
        &self.required
    }

    pub fn requested(&self) -> &[T] {
        &self.requested
    }

    pub fn require(&mut self, item: T) {
        self.requested.retain(|existing| existing != &item);
        if !self.required.contains(&item) {
            self.required.push(item);
        }
    }

    pub fn request(&mut self, item: T) {
        if !self.required.contains(&item) && !self.requested.contains(&item) {
            self.requested.push(item);
        }
    }

    pub fn contains(&self, item: &T) -> bool {
        self.required.contains(item) || self.requested.contains(item)
    }

    pub fn is_required(&self, item: &T) -> bool {
        self.required.contains(item)
    }

    pub fn is_empty(&self) -> bool {
        self.required.is_empty() && self.requested.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn require_above_requested_pulls_requested_up() {
        let mut count = Tiered::new(2u32);
        count.require(5);
        assert_eq!((count.required(), count.requested()), (5, 5));
    }

    #[test]
    fn request_below_required_pulls_required_down() {
        let mut memory = Tiered::new(0u64).with_required(1 << 30);
        memory.request(1 << 20);
        assert_eq!(memory.required(), 1 << 20);
        assert_eq!(memory.requested(), 1 << 20);
    }

    #[test]
    fn compatible_tiers_are_left_alone() {
        let tier = Tiered::new(1u32).with_required(2).with_requested(4);
        assert_eq!((tier.required(), tier.requested()), (2, 4));
    }

    #[test]
    fn list_promotes_requested_items() {
        let mut list = TieredList::default();
        list.request("a");
        list.request("b");
        list.require("a");
        list.request("a");
        assert_eq!(list.required(), ["a"]);
        assert_eq!(list.requested(), ["b"]);
        assert!(list.contains(&"b"));
        assert!(!list.is_required(&"b"));
    }
}
