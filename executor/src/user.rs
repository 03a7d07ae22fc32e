//! User and group lookup against the guest's own passwd and group files.

use std::fs;
use std::path::Path;

use crate::ExecutorError;

/// Identity a session's process switches to before exec.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credential {
    pub uid: u32,
    pub gid: u32,
    pub groups: Vec<u32>,
}

struct PasswdEntry {
    name: String,
    uid: u32,
    gid: u32,
}

struct GroupEntry {
    name: String,
    gid: u32,
    members: Vec<String>,
}

fn read_lines(path: &Path) -> Result<Vec<Vec<String>>, ExecutorError> {
    let contents = fs::read_to_string(path).map_err(|e| {
        ExecutorError::Platform(format!("unable to read {}: {}", path.display(), e))
    })?;
    Ok(contents
        .lines()
        .filter(|l| !l.trim().is_empty() && !l.starts_with('#'))
        .map(|l| l.split(':').map(str::to_string).collect())
        .collect())
}

fn passwd(root: &Path) -> Result<Vec<PasswdEntry>, ExecutorError> {
    Ok(read_lines(&root.join("etc/passwd"))?
        .into_iter()
        .filter(|f| f.len() >= 4)
        .filter_map(|f| {
            Some(PasswdEntry {
                uid: f[2].parse().ok()?,
                gid: f[3].parse().ok()?,
                name: f[0].clone(),
            })
        })
        .collect())
}

fn groups(root: &Path) -> Result<Vec<GroupEntry>, ExecutorError> {
    let path = root.join("etc/group");
    if !path.exists() {
        return Ok(Vec::new());
    }
    Ok(read_lines(&path)?
        .into_iter()
        .filter(|f| f.len() >= 3)
        .filter_map(|f| {
            Some(GroupEntry {
                gid: f[2].parse().ok()?,
                members: f
                    .get(3)
                    .map(|m| {
                        m.split(',')
                            .filter(|s| !s.is_empty())
                            .map(str::to_string)
                            .collect()
                    })
                    .unwrap_or_default(),
                name: f[0].clone(),
            })
        })
        .collect())
}

/// Resolve `user` and `group` (names or numeric ids) to a credential.
///
/// Returns `None` when neither is set. A numeric user without a passwd entry
/// runs with gid 0 unless a group is given.
pub fn resolve(root: &Path, user: &str, group: &str) -> Result<Option<Credential>, ExecutorError> {
    if user.is_empty() && group.is_empty() {
        return Ok(None);
    }

    let users = if user.is_empty() { Vec::new() } else { passwd(root)? };
    let all_groups = groups(root)?;

    let (uid, mut gid, name) = if user.is_empty() {
        (0, 0, String::from("root"))
    } else if let Some(u) = users.iter().find(|u| u.name == user) {
        (u.uid, u.gid, u.name.clone())
    } else if let Ok(uid) = user.parse::<u32>() {
        match users.iter().find(|u| u.uid == uid) {
            Some(u) => (u.uid, u.gid, u.name.clone()),
            None => (uid, 0, String::new()),
        }
    } else {
        return Err(ExecutorError::config(format!("unable to find user {}", user)));
    };

    if !group.is_empty() {
        gid = match all_groups.iter().find(|g| g.name == group) {
            Some(g) => g.gid,
            None => group
                .parse()
                .map_err(|_| ExecutorError::config(format!("unable to find group {}", group)))?,
        };
    }

    let mut supplementary: Vec<u32> = all_groups
        .iter()
        .filter(|g| !name.is_empty() && g.members.iter().any(|m| *m == name))
        .map(|g| g.gid)
        .collect();
    if !supplementary.contains(&gid) {
        supplementary.insert(0, gid);
    }

    Ok(Some(Credential {
        uid,
        gid,
        groups: supplementary,
    }))
}
