//! `user` provider built on the shadow-utils commands.

use tracing::{debug, info};

use super::{unsupported, Provider, ProviderContext};
use crate::error::Result;
use crate::infrastructure::accounts::{self, Account};
use crate::infrastructure::CommandSpec;
use crate::resource::Resource;

pub struct UserProvider;

impl Provider for UserProvider {
    fn name(&self) -> &'static str {
        "User"
    }

    fn run_action(&mut self, action: &str, resource: &mut Resource, ctx: &ProviderContext<'_>) -> Result<()> {
        match action {
            "create" => create(resource, ctx),
            "remove" => remove(resource, ctx),
            "nothing" => Ok(()),
            other => Err(unsupported(self, other, resource)),
        }
    }
}

fn flag(args: &mut Vec<String>, name: &str, value: String) {
    args.push(name.to_string());
    args.push(value);
}

fn gid_matches(wanted: &str, account: &Account) -> Result<bool> {
    if let Ok(gid) = wanted.parse::<u32>() {
        return Ok(gid == account.gid);
    }
    Ok(accounts::lookup_group(wanted)?.map_or(false, |g| g.gid == account.gid))
}

/// Supplementary groups the user is not yet a member of.
fn missing_groups(username: &str, wanted: &[String], ctx: &ProviderContext<'_>) -> Result<Vec<String>> {
    if wanted.is_empty() {
        return Ok(Vec::new());
    }
    let current = ctx.run_checked(CommandSpec::argv(["id", "-nG", username]))?.stdout();
    let current: Vec<&str> = current.split_whitespace().collect();
    Ok(wanted
        .iter()
        .filter(|g| !current.contains(&g.as_str()))
        .cloned()
        .collect())
}

fn create(resource: &mut Resource, ctx: &ProviderContext<'_>) -> Result<()> {
    let username = resource.required_str("username")?.to_string();
    let groups = resource.list_attr("groups");
    let uid = resource.int_attr("uid");
    let gid = resource.str_attr("gid");
    let home = resource.str_attr("home");
    let shell = resource.str_attr("shell");

    let mut args: Vec<String> = Vec::new();

    let verb = match accounts::lookup_user(&username)? {
        None => {
            if let Some(uid) = uid {
                flag(&mut args, "-u", uid.to_string());
            }
            if let Some(gid) = gid {
                flag(&mut args, "-g", gid.to_string());
            }
            if !groups.is_empty() {
                flag(&mut args, "-G", groups.join(","));
            }
            if let Some(home) = home {
                flag(&mut args, "-d", home.to_string());
            }
            if let Some(shell) = shell {
                flag(&mut args, "-s", shell.to_string());
            }
            if resource.bool_attr("system") {
                args.push("-r".to_string());
            } else {
                args.push("-m".to_string());
            }
            "useradd"
        }
        Some(account) => {
            if let Some(uid) = uid.filter(|u| *u != i64::from(account.uid)) {
                flag(&mut args, "-u", uid.to_string());
            }
            if let Some(gid) = gid {
                if !gid_matches(gid, &account)? {
                    flag(&mut args, "-g", gid.to_string());
                }
            }
            let missing = missing_groups(&username, &groups, ctx)?;
            if !missing.is_empty() {
                args.push("-a".to_string());
                flag(&mut args, "-G", missing.join(","));
            }
            if let Some(home) = home.filter(|h| account.home.as_os_str() != *h) {
                flag(&mut args, "-d", home.to_string());
            }
            if let Some(shell) = shell.filter(|s| account.shell.as_os_str() != *s) {
                flag(&mut args, "-s", shell.to_string());
            }
            if args.is_empty() {
                debug!(user = %username, "account up to date");
                return Ok(());
            }
            "usermod"
        }
    };

    let argv: Vec<String> = std::iter::once(verb.to_string())
        .chain(args)
        .chain(std::iter::once(username.clone()))
        .collect();
    ctx.run_checked(CommandSpec::argv(argv))?;
    info!(user = %username, command = verb, "account converged");
    resource.mark_updated();
    Ok(())
}

fn remove(resource: &mut Resource, ctx: &ProviderContext<'_>) -> Result<()> {
    let username = resource.required_str("username")?.to_string();
    if accounts::lookup_user(&username)?.is_none() {
        return Ok(());
    }
    ctx.run_checked(CommandSpec::argv(["userdel", username.as_str()]))?;
    info!(user = %username, "account removed");
    resource.mark_updated();
    Ok(())
}
