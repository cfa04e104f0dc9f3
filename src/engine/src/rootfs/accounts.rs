//! `/etc/passwd` and `/etc/group` handling.
//!
//! Packages (usually the base layout) ship initial account databases.
//! Declared accounts are merged into them: a declared entry replaces a
//! package entry of the same name, new entries are appended.

use std::collections::BTreeSet;

use forge_core::error::{ForgeError, Result};
use forge_core::manifest::{Accounts, Group, User};

use super::tree::{FsNode, FsTree};

const PASSWD: &str = "etc/passwd";
const GROUP: &str = "etc/group";

/// Numeric ids known to the assembled image.
#[derive(Debug, Clone, Default)]
pub struct IdTable {
    users: BTreeSet<u32>,
    groups: BTreeSet<u32>,
    user_names: BTreeSet<String>,
}

impl IdTable {
    pub fn has_uid(&self, uid: u32) -> bool {
        uid == 0 || self.users.contains(&uid)
    }

    pub fn has_gid(&self, gid: u32) -> bool {
        gid == 0 || self.groups.contains(&gid)
    }

    pub fn has_user(&self, name: &str) -> bool {
        self.user_names.contains(name)
    }
}

fn passwd_line(user: &User) -> String {
    let home = user
        .homedir
        .clone()
        .unwrap_or_else(|| format!("/home/{}", user.username));
    format!(
        "{}:x:{}:{}:{}:{}:{}",
        user.username,
        user.uid,
        user.gid.unwrap_or(user.uid),
        user.username,
        home,
        user.shell.as_deref().unwrap_or("/bin/sh")
    )
}

fn group_line(group: &Group) -> String {
    format!(
        "{}:x:{}:{}",
        group.groupname,
        group.gid,
        group.members.join(",")
    )
}

/// Replace lines whose first field matches a declared name, append the rest.
fn merge_lines(existing: &str, declared: Vec<(String, String)>) -> String {
    let mut lines: Vec<String> = Vec::new();
    let mut pending = declared;
    for line in existing.lines().filter(|l| !l.trim().is_empty()) {
        let name = line.split(':').next().unwrap_or_default();
        match pending.iter().position(|(n, _)| n == name) {
            Some(i) => lines.push(pending.remove(i).1),
            None => lines.push(line.to_string()),
        }
    }
    lines.extend(pending.into_iter().map(|(_, line)| line));
    let mut text = lines.join("\n");
    if !text.is_empty() {
        text.push('\n');
    }
    text
}

fn read_text(tree: &FsTree, path: &str) -> String {
    tree.read_file(path)
        .map(|data| String::from_utf8_lossy(data).to_string())
        .unwrap_or_default()
}

/// Write declared accounts into the tree and create missing home directories.
pub fn apply_accounts(tree: &mut FsTree, accounts: &Accounts) -> Result<()> {
    if accounts.users.is_empty() && accounts.groups.is_empty() {
        return Ok(());
    }

    let groups = accounts
        .groups
        .iter()
        .map(|g| (g.groupname.clone(), group_line(g)))
        .collect();
    let group_text = merge_lines(&read_text(tree, GROUP), groups);
    tree.insert(GROUP, FsNode::file(group_text.into_bytes(), 0o644, 0, 0));

    let users = accounts
        .users
        .iter()
        .map(|u| (u.username.clone(), passwd_line(u)))
        .collect();
    let passwd_text = merge_lines(&read_text(tree, PASSWD), users);
    tree.insert(PASSWD, FsNode::file(passwd_text.into_bytes(), 0o644, 0, 0));

    for user in &accounts.users {
        let home = user
            .homedir
            .clone()
            .unwrap_or_else(|| format!("/home/{}", user.username));
        if !tree.contains(&home) {
            tree.insert(
                &home,
                FsNode::directory(0o755, user.uid, user.gid.unwrap_or(user.uid)),
            );
        }
    }

    tracing::debug!(
        users = accounts.users.len(),
        groups = accounts.groups.len(),
        "Wrote account databases"
    );
    Ok(())
}

/// Collect the uids and gids defined by the tree's account databases.
pub fn id_table(tree: &FsTree) -> IdTable {
    let mut table = IdTable::default();
    for line in read_text(tree, PASSWD).lines() {
        let fields: Vec<&str> = line.split(':').collect();
        if fields.len() < 4 {
            continue;
        }
        table.user_names.insert(fields[0].to_string());
        if let Ok(uid) = fields[2].parse() {
            table.users.insert(uid);
        }
        if let Ok(gid) = fields[3].parse() {
            table.groups.insert(gid);
        }
    }
    for line in read_text(tree, GROUP).lines() {
        let fields: Vec<&str> = line.split(':').collect();
        if fields.len() < 3 {
            continue;
        }
        if let Ok(gid) = fields[2].parse() {
            table.groups.insert(gid);
        }
    }
    table
}

/// Check that the run-as identity exists in the image.
pub fn check_run_as(table: &IdTable, run_as: &str) -> Result<()> {
    let user = run_as.split(':').next().unwrap_or(run_as);
    let known = match user.parse::<u32>() {
        Ok(uid) => table.has_uid(uid),
        Err(_) => table.has_user(user),
    };
    if known {
        Ok(())
    } else {
        Err(ForgeError::AssemblyError(format!(
            "run-as user '{}' is not defined in /etc/passwd",
            run_as
        )))
    }
}
