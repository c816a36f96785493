use std::collections::HashMap;

/// Owning table keyed by monotonically increasing ids.
///
/// Ids start at 1 and are never handed out twice for the lifetime of the
/// registry, so an id that outlives its entry can only ever miss; it never
/// aliases a newer object.
#[derive(Debug)]
pub struct Registry<T> {
    items: HashMap<u32, T>,
    next_id: u32,
}

impl<T> Default for Registry<T> {
    fn default() -> Self {
        Self {
            items: HashMap::new(),
            next_id: 1,
        }
    }
}

impl<T> Registry<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store `item` under a fresh id. Returns `None` once the id space is used up.
    pub fn insert(&mut self, item: T) -> Option<u32> {
        self.try_insert(item).ok()
    }

    /// Like [`Registry::insert`], but hands `item` back when no id is left.
    pub fn try_insert(&mut self, item: T) -> Result<u32, T> {
        let id = self.next_id;
        match self.next_id.checked_add(1) {
            Some(next) => self.next_id = next,
            None => return Err(item),
        }
        self.items.insert(id, item);
        Ok(id)
    }

    pub fn release(&mut self, id: u32) -> Option<T> {
        self.items.remove(&id)
    }

    pub fn get_ref(&self, id: u32) -> Option<&T> {
        self.items.get(&id)
    }

    pub fn get_mut_ref(&mut self, id: u32) -> Option<&mut T> {
        self.items.get_mut(&id)
    }

    pub fn contains(&self, id: u32) -> bool {
        self.items.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Remove every entry. Ids keep counting from where they were.
    pub fn drain(&mut self) -> impl Iterator<Item = (u32, T)> + '_ {
        self.items.drain()
    }
}
