use std::collections::HashMap;

use crate::error::StoreError;
use crate::types::TaskId;

#[derive(Debug)]
struct Node<V> {
    id: TaskId,
    value: V,
    prev: Option<usize>,
    next: Option<usize>,
}

#[derive(Debug)]
enum Cell<V> {
    Occupied(Node<V>),
    Vacant { next_free: Option<usize> },
}

/// Capacity-bounded FIFO keyed by task id.
///
/// Backed by an arena of doubly-linked nodes plus an id index, so
/// append, pop-from-front and removal of an arbitrary id are all O(1).
/// Freed cells go on a free list and are reused.
#[derive(Debug)]
pub struct OrderedStore<V> {
    cells: Vec<Cell<V>>,
    free_head: Option<usize>,
    index: HashMap<TaskId, usize>,
    head: Option<usize>,
    tail: Option<usize>,
    len: usize,
    capacity: usize,
}

impl<V> OrderedStore<V> {
    pub fn new(capacity: usize) -> Self {
        Self {
            cells: Vec::new(),
            free_head: None,
            index: HashMap::new(),
            head: None,
            tail: None,
            len: 0,
            capacity,
        }
    }

    /// Append to the tail. Fails without mutating on a full store or a
    /// duplicate id.
    pub fn push_back(&mut self, id: TaskId, value: V) -> Result<(), StoreError> {
        if self.len >= self.capacity {
            return Err(StoreError::CapacityExceeded);
        }
        if self.index.contains_key(&id) {
            return Err(StoreError::DuplicateId);
        }

        let node = Node {
            id: id.clone(),
            value,
            prev: self.tail,
            next: None,
        };
        let idx = self.alloc(node);

        match self.tail {
            Some(tail) => self.node_mut(tail).next = Some(idx),
            None => self.head = Some(idx),
        }
        self.tail = Some(idx);
        self.index.insert(id, idx);
        self.len += 1;
        Ok(())
    }

    /// Remove and return the head.
    pub fn pop_front(&mut self) -> Result<V, StoreError> {
        let head = self.head.ok_or(StoreError::Empty)?;
        let value = self.detach(head);
        Ok(value)
    }

    /// Return the head without removing it.
    pub fn peek_front(&self) -> Result<&V, StoreError> {
        let head = self.head.ok_or(StoreError::Empty)?;
        Ok(&self.node(head).value)
    }

    /// Remove an arbitrary entry by id, splicing its neighbors.
    pub fn remove(&mut self, id: &TaskId) -> Result<V, StoreError> {
        let idx = *self.index.get(id).ok_or(StoreError::NotFound)?;
        Ok(self.detach(idx))
    }

    pub fn contains(&self, id: &TaskId) -> bool {
        self.index.contains_key(id)
    }

    /// Iterate head to tail without mutating the store.
    pub fn iter(&self) -> Iter<'_, V> {
        Iter {
            store: self,
            next: self.head,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.head.is_none()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    fn alloc(&mut self, node: Node<V>) -> usize {
        match self.free_head {
            Some(idx) => {
                self.free_head = match &self.cells[idx] {
                    Cell::Vacant { next_free } => *next_free,
                    Cell::Occupied(_) => unreachable!("free list points at occupied cell"),
                };
                self.cells[idx] = Cell::Occupied(node);
                idx
            }
            None => {
                self.cells.push(Cell::Occupied(node));
                self.cells.len() - 1
            }
        }
    }

    /// Unlink a node, fix up head/tail and neighbors, recycle the cell.
    fn detach(&mut self, idx: usize) -> V {
        let vacant = Cell::Vacant {
            next_free: self.free_head,
        };
        let node = match std::mem::replace(&mut self.cells[idx], vacant) {
            Cell::Occupied(node) => node,
            Cell::Vacant { .. } => unreachable!("detach of vacant cell"),
        };
        self.free_head = Some(idx);
        self.index.remove(&node.id);

        match node.prev {
            Some(prev) => self.node_mut(prev).next = node.next,
            None => self.head = node.next,
        }
        match node.next {
            Some(next) => self.node_mut(next).prev = node.prev,
            None => self.tail = node.prev,
        }
        self.len -= 1;
        node.value
    }

    fn node(&self, idx: usize) -> &Node<V> {
        match &self.cells[idx] {
            Cell::Occupied(node) => node,
            Cell::Vacant { .. } => unreachable!("link points at vacant cell"),
        }
    }

    fn node_mut(&mut self, idx: usize) -> &mut Node<V> {
        match &mut self.cells[idx] {
            Cell::Occupied(node) => node,
            Cell::Vacant { .. } => unreachable!("link points at vacant cell"),
        }
    }
}

impl<V: Clone> OrderedStore<V> {
    /// Full ordered sequence, head first.
    pub fn snapshot(&self) -> Vec<V> {
        self.iter().cloned().collect()
    }
}

pub struct Iter<'a, V> {
    store: &'a OrderedStore<V>,
    next: Option<usize>,
}

impl<'a, V> Iterator for Iter<'a, V> {
    type Item = &'a V;

    fn next(&mut self) -> Option<&'a V> {
        let idx = self.next?;
        let node = self.store.node(idx);
        self.next = node.next;
        Some(&node.value)
    }
}
