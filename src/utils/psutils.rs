use std::collections::{BTreeSet, HashMap};
use sysinfo::System;
use users::{Users, UsersCache};

pub fn resolve_username(uid: u32, users_cache: &UsersCache) -> String {
    users_cache
        .get_user_by_uid(uid)
        .map(|user| user.name().to_string_lossy().to_string())
        .unwrap_or_else(|| uid.to_string())
}

/// Name of the user running this process, falling back to the numeric uid.
pub fn current_username() -> String {
    let users_cache = UsersCache::new();
    resolve_username(users::get_current_uid(), &users_cache)
}

/// Expands `roots` with all their descendants given `(pid, parent)` pairs.
fn expand_descendants(processes: &[(u32, Option<u32>)], roots: &[u32]) -> Vec<u32> {
    let mut children: HashMap<u32, Vec<u32>> = HashMap::new();
    for &(pid, parent) in processes {
        if let Some(parent) = parent {
            children.entry(parent).or_default().push(pid);
        }
    }

    let mut tree: BTreeSet<u32> = BTreeSet::new();
    let mut stack: Vec<u32> = roots.to_vec();
    while let Some(pid) = stack.pop() {
        if tree.insert(pid) {
            if let Some(kids) = children.get(&pid) {
                stack.extend(kids);
            }
        }
    }
    tree.into_iter().collect()
}

/// Collects `roots` and every live descendant of them. Used to match GPU
/// processes when devices are selected by PID.
pub fn collect_process_tree(roots: &[u32]) -> Vec<u32> {
    let system = System::new_all();
    let processes: Vec<(u32, Option<u32>)> = system
        .processes()
        .iter()
        .map(|(pid, process)| (pid.as_u32(), process.parent().map(|p| p.as_u32())))
        .collect();
    expand_descendants(&processes, roots)
}
