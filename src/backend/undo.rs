// Rollback stack for multi-step provisioning
//
// Each successful creation step pushes its matching destroy action. On
// failure the stack is unwound newest-first; on success it is committed
// and the actions are discarded without running.

/// Reverse-order cleanup queue. `C` is whatever the destroy actions need
/// mutable access to: a device wrapper, an allocator, or nothing.
pub struct UndoStack<'a, C = ()> {
    actions: Vec<(&'static str, Box<dyn FnOnce(&mut C) + 'a>)>,
}

impl<C> Default for UndoStack<'_, C> {
    fn default() -> Self {
        Self::new()
    }
}

impl<'a, C> UndoStack<'a, C> {
    pub fn new() -> Self {
        Self {
            actions: Vec::new(),
        }
    }

    /// Register the destroy action for something that was just created.
    pub fn push(&mut self, label: &'static str, action: impl FnOnce(&mut C) + 'a) {
        self.actions.push((label, Box::new(action)));
    }

    pub fn len(&self) -> usize {
        self.actions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }

    /// Run every registered action, newest first.
    pub fn unwind(mut self, context: &mut C) {
        if !self.actions.is_empty() {
            log::debug!("Rolling back {} provisioning step(s)", self.actions.len());
        }
        while let Some((label, action)) = self.actions.pop() {
            log::trace!("Undo: {}", label);
            action(context);
        }
    }

    /// Keep everything that was created; drop the actions unrun.
    pub fn commit(mut self) {
        self.actions.clear();
    }
}

impl UndoStack<'_, ()> {
    pub fn unwind_all(self) {
        self.unwind(&mut ());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unwinds_in_reverse_order() {
        let mut order: Vec<u32> = Vec::new();
        let mut stack: UndoStack<Vec<u32>> = UndoStack::new();
        for i in 0..4 {
            stack.push("step", move |order: &mut Vec<u32>| order.push(i));
        }
        assert_eq!(stack.len(), 4);
        stack.unwind(&mut order);
        assert_eq!(order, vec![3, 2, 1, 0]);
    }

    #[test]
    fn commit_runs_nothing() {
        let order: Vec<u32> = Vec::new();
        let mut stack: UndoStack<Vec<u32>> = UndoStack::new();
        stack.push("step", |order: &mut Vec<u32>| order.push(1));
        stack.commit();
        assert!(order.is_empty());
    }
}
