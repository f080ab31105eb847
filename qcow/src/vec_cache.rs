// Copyright 2018 The Chromium OS Authors. All rights reserved.
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE-BSD-3-Clause file.
//
// SPDX-License-Identifier: Apache-2.0 AND BSD-3-Clause

use std::collections::{HashMap, VecDeque};
use std::io;
use std::ops::{Index, IndexMut};

/// Trait that allows for checking if an implementor is dirty. Useful for types that are cached so
/// it can be checked if they need to be committed to disk.
pub trait Cacheable {
    /// Used to check if the item needs to be written out or if it can be discarded.
    fn dirty(&self) -> bool;
}

#[derive(Clone, Debug)]
/// Represents a vector that implements the `Cacheable` trait so it can be held in a cache.
pub struct VecCache<T: 'static + Copy + Default> {
    vec: Box<[T]>,
    dirty: bool,
}

impl<T: 'static + Copy + Default> VecCache<T> {
    /// Creates a `VecCache` that can hold `count` elements.
    pub fn new(count: usize) -> VecCache<T> {
        VecCache {
            vec: vec![Default::default(); count].into_boxed_slice(),
            dirty: true,
        }
    }

    /// Creates a `VecCache` from the passed in `vec`.
    pub fn from_vec(vec: Vec<T>) -> VecCache<T> {
        VecCache {
            vec: vec.into_boxed_slice(),
            dirty: false,
        }
    }

    pub fn get(&self, index: usize) -> Option<&T> {
        self.vec.get(index)
    }

    /// Gets a reference to the underlying vector.
    pub fn get_values(&self) -> &[T] {
        &self.vec
    }

    /// Mark this cache element as clean.
    pub fn mark_clean(&mut self) {
        self.dirty = false;
    }

    /// Mark this cache element as needing a write, without changing its contents.
    pub fn mark_dirty(&mut self) {
        self.dirty = true;
    }

    /// Returns the number of elements in the vector.
    pub fn len(&self) -> usize {
        self.vec.len()
    }
}

impl<T: 'static + Copy + Default> Cacheable for VecCache<T> {
    fn dirty(&self) -> bool {
        self.dirty
    }
}

impl<T: 'static + Copy + Default> Index<usize> for VecCache<T> {
    type Output = T;

    fn index(&self, index: usize) -> &T {
        self.vec.index(index)
    }
}

impl<T: 'static + Copy + Default> IndexMut<usize> for VecCache<T> {
    fn index_mut(&mut self, index: usize) -> &mut T {
        self.dirty = true;
        self.vec.index_mut(index)
    }
}

/// A map of cached tables holding at most `capacity` entries. The oldest entry is evicted first.
#[derive(Clone, Debug)]
pub struct CacheMap<T: Cacheable> {
    capacity: usize,
    map: HashMap<usize, T>,
    order: VecDeque<usize>,
}

impl<T: Cacheable> CacheMap<T> {
    pub fn new(capacity: usize) -> Self {
        CacheMap {
            capacity,
            map: HashMap::with_capacity(capacity),
            order: VecDeque::with_capacity(capacity),
        }
    }

    pub fn contains_key(&self, key: usize) -> bool {
        self.map.contains_key(&key)
    }

    pub fn get(&self, index: usize) -> Option<&T> {
        self.map.get(&index)
    }

    pub fn get_mut(&mut self, index: usize) -> Option<&mut T> {
        self.map.get_mut(&index)
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (&usize, &mut T)> {
        self.map.iter_mut()
    }

    /// Drops every cached entry without writing it back.
    pub fn clear(&mut self) {
        self.map.clear();
        self.order.clear();
    }

    // Check if the cache is full and we need to evict.
    pub fn insert<F>(&mut self, index: usize, block: T, write_callback: F) -> io::Result<()>
    where
        F: FnOnce(usize, T) -> io::Result<()>,
    {
        if self.map.insert(index, block).is_some() {
            return Ok(());
        }
        self.order.push_back(index);
        if self.map.len() > self.capacity {
            if let Some(to_evict) = self.order.pop_front() {
                if let Some(evicted) = self.map.remove(&to_evict) {
                    if evicted.dirty() {
                        write_callback(to_evict, evicted)?;
                    }
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod unit_tests {
    use super::*;

    struct NumCache(bool);
    impl Cacheable for NumCache {
        fn dirty(&self) -> bool {
            self.0
        }
    }

    #[test]
    fn evicts_oldest_when_full() {
        let mut cache = CacheMap::<NumCache>::new(3);
        let mut evicted = None;
        for i in 0..3 {
            cache
                .insert(i, NumCache(true), |index, _| {
                    evicted = Some(index);
                    Ok(())
                })
                .unwrap();
        }
        assert_eq!(evicted, None);
        cache
            .insert(3, NumCache(true), |index, _| {
                evicted = Some(index);
                Ok(())
            })
            .unwrap();
        assert_eq!(evicted, Some(0));

        let num_items = (0..=3).filter(|k| cache.contains_key(*k)).count();
        assert_eq!(num_items, 3);
        assert!(cache.contains_key(3));
    }

    #[test]
    fn clean_entries_are_not_written() {
        let mut cache = CacheMap::<NumCache>::new(1);
        cache.insert(0, NumCache(false), |_, _| Ok(())).unwrap();
        cache
            .insert(1, NumCache(true), |_, _| panic!("clean entry written back"))
            .unwrap();
        assert!(!cache.contains_key(0));
    }

    #[test]
    fn vec_cache_tracks_writes() {
        let mut table = VecCache::<u64>::from_vec(vec![0; 4]);
        assert!(!table.dirty());
        table[2] = 7;
        assert!(table.dirty());
        assert_eq!(table.get_values(), &[0, 0, 7, 0]);
        table.mark_clean();
        assert!(!table.dirty());
        assert!(VecCache::<u16>::new(2).dirty());
    }
}
