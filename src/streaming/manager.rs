//! Page streaming state machine
//!
//! Owns the GPU page slot pools and decides, once per frame, which
//! pages stream in and out. Admission is dependency-gated: a page only
//! commits when every page it patches is already resident or pending.
//! Root pages are installed when a geometry is added and never leave.

use std::collections::{HashMap, HashSet};

use bytemuck::{Pod, Zeroable};

use crate::core::Error;
use crate::core::types::Result;
use crate::page::{Page, PageFixups, ROOT_PAGE_CAPACITY, STREAMING_PAGE_CAPACITY};
use crate::streaming::feedback::parse_feedback;
use crate::streaming::slots::{PageKey, PageSlotList, SlotId};

/// Byte stride of one slot in the GPU page-data buffer
pub const PAGE_SLOT_BYTES: u32 = if ROOT_PAGE_CAPACITY > STREAMING_PAGE_CAPACITY {
    ROOT_PAGE_CAPACITY
} else {
    STREAMING_PAGE_CAPACITY
};

/// Patches one resident cluster's leaf flag
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Pod, Zeroable)]
pub struct ClusterFixupUpdate {
    pub gpu_page_index: u32,
    pub cluster_index: u32,
    pub flag: u32,
    pub padding: u32,
}

const _: () = assert!(std::mem::size_of::<ClusterFixupUpdate>() % 16 == 0);

/// Patches one resident part's hierarchy visibility
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Pod, Zeroable)]
pub struct HierarchyFixupUpdate {
    pub gpu_page_index: u32,
    pub part_index: u32,
    pub flag: u32,
    pub padding: u32,
}

const _: () = assert!(std::mem::size_of::<HierarchyFixupUpdate>() % 16 == 0);

/// Tells the caller's GPU layer where to copy a page blob
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Pod, Zeroable)]
pub struct PageUpload {
    pub gpu_page_index: u32,
    pub offset: u32,
    pub size: u32,
    pub padding: u32,
}

const _: () = assert!(std::mem::size_of::<PageUpload>() % 16 == 0);

/// Everything the caller must execute on the GPU this frame.
/// `upload_keys[i]` names the page whose bytes back `uploads[i]`.
#[derive(Debug, Default, Clone)]
pub struct FrameCommands {
    pub uploads: Vec<PageUpload>,
    pub upload_keys: Vec<PageKey>,
    pub cluster_fixups: Vec<ClusterFixupUpdate>,
    pub hierarchy_fixups: Vec<HierarchyFixupUpdate>,
}

struct GeometryResource {
    pages: Vec<Page>,
    num_root_pages: u32,
    fixups: PageFixups,
    dependencies: Vec<Vec<u32>>,
}

pub struct StreamingManager {
    streaming_slots: PageSlotList,
    root_slots: PageSlotList,
    max_streaming_pages: u32,
    current_root_pages: u32,
    resources: Vec<GeometryResource>,
    resident: HashMap<PageKey, SlotId>,
    pending: HashMap<PageKey, SlotId>,
    pending_order: Vec<PageKey>,
}

impl StreamingManager {
    pub fn new(max_streaming_pages: u32, max_root_pages: u32) -> Self {
        Self {
            streaming_slots: PageSlotList::new(0, max_streaming_pages),
            root_slots: PageSlotList::new(max_streaming_pages, max_root_pages),
            max_streaming_pages,
            current_root_pages: 0,
            resources: Vec::new(),
            resident: HashMap::new(),
            pending: HashMap::new(),
            pending_order: Vec::new(),
        }
    }

    /// Register a built geometry and queue its root pages for upload.
    /// The root pool grows when the guarantee would otherwise break.
    pub fn add_geometry(
        &mut self,
        pages: Vec<Page>,
        fixups: PageFixups,
        dependencies: Vec<Vec<u32>>,
    ) -> Result<u32> {
        if fixups.cluster_fixups.len() != pages.len() || dependencies.len() != pages.len() {
            return Err(Error::Streaming(format!(
                "fixup/dependency tables sized for {}/{} pages, geometry has {}",
                fixups.cluster_fixups.len(),
                dependencies.len(),
                pages.len()
            )));
        }
        for page in &pages {
            if page.data_byte_size > PAGE_SLOT_BYTES {
                return Err(Error::Streaming(format!(
                    "page of {} bytes exceeds the {} byte slot",
                    page.data_byte_size, PAGE_SLOT_BYTES
                )));
            }
        }

        let num_root_pages = pages.iter().filter(|p| p.is_root).count() as u32;
        if self.current_root_pages + num_root_pages > self.root_slots.len() {
            let added = self.current_root_pages + num_root_pages - self.root_slots.len();
            self.root_slots.grow(added);
            log::info!("root page pool grown by {} slots", added);
        }

        let resource = self.resources.len() as u32;
        self.resources.push(GeometryResource {
            pages,
            num_root_pages,
            fixups,
            dependencies,
        });

        for page in 0..num_root_pages {
            let key = PageKey { resource, page };
            let slot = self
                .root_slots
                .acquire()
                .ok_or_else(|| Error::Streaming("root page pool exhausted".into()))?;
            self.root_slots.set_pending(slot, Some(key));
            self.pending.insert(key, slot);
            self.pending_order.push(key);
            self.add_dependency_refs(key);
        }
        self.current_root_pages += num_root_pages;

        Ok(resource)
    }

    /// Drop a geometry and free its slots. Later resources shift down
    /// one index, matching the compacting resource table.
    pub fn remove_geometry(&mut self, resource: u32) {
        if resource as usize >= self.resources.len() {
            return;
        }

        let removed: Vec<(PageKey, SlotId)> = self
            .resident
            .iter()
            .chain(self.pending.iter())
            .filter(|(key, _)| key.resource == resource)
            .map(|(&key, &slot)| (key, slot))
            .collect();
        for (key, slot) in removed {
            if self.root_slots.contains(slot) {
                self.root_slots.release(slot);
            } else {
                self.streaming_slots.release(slot);
            }
            self.resident.remove(&key);
            self.pending.remove(&key);
        }
        self.pending_order.retain(|key| key.resource != resource);

        let resources_removed = self.resources[resource as usize].num_root_pages;
        self.current_root_pages -= resources_removed;
        self.resources.remove(resource as usize);

        let remap = |key: PageKey| PageKey {
            resource: if key.resource > resource {
                key.resource - 1
            } else {
                key.resource
            },
            page: key.page,
        };
        self.resident = self
            .resident
            .drain()
            .map(|(key, slot)| (remap(key), slot))
            .collect();
        self.pending = self
            .pending
            .drain()
            .map(|(key, slot)| (remap(key), slot))
            .collect();
        for key in self.pending_order.iter_mut() {
            *key = remap(*key);
        }
        for (&key, &slot) in self.resident.iter().chain(self.pending.iter()) {
            let pool = if self.root_slots.contains(slot) {
                &mut self.root_slots
            } else {
                &mut self.streaming_slots
            };
            if pool.resident(slot).is_some() {
                pool.set_resident(slot, Some(key));
            } else {
                pool.set_pending(slot, Some(key));
            }
        }
    }

    pub fn is_resident(&self, key: PageKey) -> bool {
        self.resident.contains_key(&key)
    }

    pub fn resident_page_count(&self) -> usize {
        self.resident.len()
    }

    /// One frame of streaming: decode feedback, admit what the
    /// dependency gate and slot pools allow, then emit uploads and
    /// fixups for every residency transition.
    pub fn update(&mut self, feedback: &[u32]) -> FrameCommands {
        let mut commands = FrameCommands::default();

        let page_counts: Vec<u32> = self
            .resources
            .iter()
            .map(|r| r.pages.len() as u32)
            .collect();
        let requests = parse_feedback(feedback, &page_counts);
        let requested: HashSet<PageKey> = requests.iter().map(|r| r.key).collect();

        for request in &requests {
            let key = request.key;
            if let Some(&slot) = self.resident.get(&key) {
                if self.streaming_slots.contains(slot) {
                    self.streaming_slots.touch(slot);
                }
                continue;
            }
            if self.pending.contains_key(&key) {
                continue;
            }
            if key.page < self.resources[key.resource as usize].num_root_pages {
                continue;
            }
            // Deferred requests surface again in later feedback
            self.pend_page_commit(key, &requested, &mut commands);
        }

        let installs = std::mem::take(&mut self.pending_order);
        for key in installs {
            let Some(slot) = self.pending.remove(&key) else {
                continue;
            };
            let pool = if self.root_slots.contains(slot) {
                &mut self.root_slots
            } else {
                &mut self.streaming_slots
            };
            pool.set_pending(slot, None);
            pool.set_resident(slot, Some(key));
            self.resident.insert(key, slot);

            let size =
                self.resources[key.resource as usize].pages[key.page as usize].data_byte_size;
            commands.uploads.push(PageUpload {
                gpu_page_index: slot,
                offset: slot * PAGE_SLOT_BYTES,
                size,
                padding: 0,
            });
            commands.upload_keys.push(key);

            self.apply_fixups(key, true, &mut commands);
        }

        commands
    }

    fn slot_for(&self, key: PageKey) -> Option<SlotId> {
        self.resident
            .get(&key)
            .or_else(|| self.pending.get(&key))
            .copied()
    }

    fn add_dependency_refs(&mut self, key: PageKey) {
        let deps = self.resources[key.resource as usize].dependencies[key.page as usize].clone();
        for dep in deps {
            let dep_key = PageKey {
                resource: key.resource,
                page: dep,
            };
            if let Some(slot) = self.slot_for(dep_key) {
                if self.root_slots.contains(slot) {
                    self.root_slots.add_ref(slot);
                } else {
                    self.streaming_slots.add_ref(slot);
                }
            }
        }
    }

    fn remove_dependency_refs(&mut self, key: PageKey) {
        let deps = self.resources[key.resource as usize].dependencies[key.page as usize].clone();
        for dep in deps {
            let dep_key = PageKey {
                resource: key.resource,
                page: dep,
            };
            if let Some(slot) = self.slot_for(dep_key) {
                if self.root_slots.contains(slot) {
                    self.root_slots.remove_ref(slot);
                } else {
                    self.streaming_slots.remove_ref(slot);
                }
            }
        }
    }

    /// Try to move a streaming page into the pending set. Fails, and
    /// the request waits for a later frame, when a dependency is
    /// absent or no slot can be freed.
    fn pend_page_commit(
        &mut self,
        key: PageKey,
        requested: &HashSet<PageKey>,
        commands: &mut FrameCommands,
    ) -> bool {
        let dependencies =
            &self.resources[key.resource as usize].dependencies[key.page as usize];
        for &dep in dependencies {
            let dep_key = PageKey {
                resource: key.resource,
                page: dep,
            };
            if !self.resident.contains_key(&dep_key) && !self.pending.contains_key(&dep_key) {
                return false;
            }
        }

        let slot = match self.streaming_slots.acquire() {
            Some(slot) => slot,
            None => {
                let Some(victim) = self.find_eviction_victim(requested) else {
                    return false;
                };
                self.evict_page(victim, commands);
                match self.streaming_slots.acquire() {
                    Some(slot) => slot,
                    None => return false,
                }
            }
        };

        self.streaming_slots.set_pending(slot, Some(key));
        self.pending.insert(key, slot);
        self.pending_order.push(key);
        self.add_dependency_refs(key);
        true
    }

    fn find_eviction_victim(&self, requested: &HashSet<PageKey>) -> Option<PageKey> {
        for slot in self.streaming_slots.iter_lru() {
            if self.streaming_slots.ref_count(slot) > 0 {
                continue;
            }
            let Some(key) = self.streaming_slots.resident(slot) else {
                continue;
            };
            if requested.contains(&key) {
                continue;
            }
            return Some(key);
        }
        None
    }

    fn evict_page(&mut self, key: PageKey, commands: &mut FrameCommands) {
        let Some(slot) = self.resident.remove(&key) else {
            return;
        };
        self.remove_dependency_refs(key);
        self.streaming_slots.release(slot);
        self.apply_fixups(key, false, commands);
    }

    /// Emit fixup records for every resident page patched by `key`
    /// changing residency. A cluster fixup clears the target's leaf
    /// flag once the whole generating group's page range is in and
    /// restores it when any of that range leaves; a hierarchy fixup
    /// enables the target part under the same completeness rule.
    fn apply_fixups(&self, key: PageKey, install: bool, commands: &mut FrameCommands) {
        let resource = &self.resources[key.resource as usize];
        let in_set = |page: u32| {
            let page_key = PageKey {
                resource: key.resource,
                page,
            };
            self.resident.contains_key(&page_key) || self.pending.contains_key(&page_key)
        };

        for fixup in &resource.fixups.cluster_fixups[key.page as usize] {
            let target = PageKey {
                resource: key.resource,
                page: fixup.fixup_page,
            };
            let Some(slot) = self.slot_for(target) else {
                continue;
            };
            // Pages encode leaf = 1; the parent cluster only refines
            // once every page of its generating group is in
            let flag = if install
                && (fixup.dependency_page_start..=fixup.dependency_page_end).all(in_set)
            {
                0
            } else {
                1
            };
            commands.cluster_fixups.push(ClusterFixupUpdate {
                gpu_page_index: slot,
                cluster_index: fixup.cluster_index_in_page,
                flag,
                padding: 0,
            });
        }

        for fixup in &resource.fixups.hierarchy_fixups[key.page as usize] {
            let target = PageKey {
                resource: key.resource,
                page: fixup.fixup_page,
            };
            let Some(slot) = self.slot_for(target) else {
                continue;
            };
            let flag = if install
                && (fixup.dependency_page_start..=fixup.dependency_page_end).all(in_set)
            {
                1
            } else {
                0
            };
            commands.hierarchy_fixups.push(HierarchyFixupUpdate {
                gpu_page_index: slot,
                part_index: fixup.part_index,
                flag,
                padding: 0,
            });
        }
    }
}
