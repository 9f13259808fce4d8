//! Cgroup modeling for the simulator.
//!
//! The registry tracks a hierarchy of task groups, each with a name, a
//! parent and a `shares` weight. Group ids are dense, never recycled, and
//! the root group always exists as id 0 with path `/`.

use crate::sched::NICE_0_LOAD;
use crate::types::GroupId;

/// Information about a group in the hierarchy.
#[derive(Debug, Clone)]
pub struct GroupInfo {
    pub id: GroupId,
    /// Parent group (`None` for the root).
    pub parent: Option<GroupId>,
    pub name: String,
    /// Depth in the hierarchy (root = 0).
    pub level: u32,
    /// Weight of the group's entity in its parent.
    pub shares: u64,
    pub children: Vec<GroupId>,
}

/// Registry managing the group hierarchy.
#[derive(Debug, Clone)]
pub struct GroupRegistry {
    groups: Vec<GroupInfo>,
}

impl Default for GroupRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl GroupRegistry {
    /// A registry holding only the root group.
    pub fn new() -> Self {
        GroupRegistry {
            groups: vec![GroupInfo {
                id: GroupId::ROOT,
                parent: None,
                name: String::new(),
                level: 0,
                shares: NICE_0_LOAD,
                children: Vec::new(),
            }],
        }
    }

    pub fn get(&self, id: GroupId) -> &GroupInfo {
        match self.groups.get(id.index()) {
            Some(g) => g,
            None => panic!("unknown group {}", id.0),
        }
    }

    /// Number of groups, root included.
    #[allow(clippy::len_without_is_empty)]
    pub fn len(&self) -> usize {
        self.groups.len()
    }

    /// Create a child of `parent`. Unnamed groups are called `cg<id>`.
    pub fn create(&mut self, parent: GroupId, name: Option<&str>) -> GroupId {
        let id = GroupId(self.groups.len() as u32);
        let level = self.get(parent).level + 1;
        let name = name.map_or_else(|| format!("cg{}", id.0), str::to_string);
        self.groups.push(GroupInfo {
            id,
            parent: Some(parent),
            name,
            level,
            shares: NICE_0_LOAD,
            children: Vec::new(),
        });
        self.groups[parent.index()].children.push(id);
        id
    }

    pub fn set_shares(&mut self, id: GroupId, shares: u64) {
        match self.groups.get_mut(id.index()) {
            Some(g) => g.shares = shares,
            None => panic!("unknown group {}", id.0),
        }
    }

    /// Look up a group by name.
    pub fn find(&self, name: &str) -> Option<GroupId> {
        self.groups
            .iter()
            .skip(1)
            .find(|g| g.name == name)
            .map(|g| g.id)
    }

    /// Slash-separated path from the root, `/` for the root itself.
    pub fn path(&self, id: GroupId) -> String {
        let mut parts = Vec::new();
        let mut cur = self.get(id);
        while let Some(parent) = cur.parent {
            parts.push(cur.name.as_str());
            cur = self.get(parent);
        }
        if parts.is_empty() {
            return "/".to_string();
        }
        parts.reverse();
        format!("/{}", parts.join("/"))
    }

    /// Whether `id` is `ancestor` or lies below it.
    pub fn is_descendant(&self, mut id: GroupId, ancestor: GroupId) -> bool {
        loop {
            if id == ancestor {
                return true;
            }
            match self.get(id).parent {
                Some(p) => id = p,
                None => return false,
            }
        }
    }

    /// All groups in creation order.
    pub fn iter(&self) -> impl Iterator<Item = &GroupInfo> {
        self.groups.iter()
    }
}
