//! Built-in resource kinds.

use super::{AttrDefault, AttrType, AttributeSpec, ResourceKind};

const fn opt(name: &'static str, kind: AttrType) -> AttributeSpec {
    AttributeSpec {
        name,
        kind,
        required: false,
        default: AttrDefault::None,
    }
}

const fn named(name: &'static str) -> AttributeSpec {
    AttributeSpec {
        name,
        kind: AttrType::String,
        required: true,
        default: AttrDefault::FromName,
    }
}

const fn with_default(name: &'static str, kind: AttrType, default: AttrDefault) -> AttributeSpec {
    AttributeSpec {
        name,
        kind,
        required: false,
        default,
    }
}

pub static FILE: ResourceKind = ResourceKind {
    name: "file",
    default_action: "create",
    actions: &["create", "delete", "nothing"],
    attributes: &[
        named("path"),
        opt("content", AttrType::String),
        opt("mode", AttrType::String),
        opt("owner", AttrType::String),
        opt("group", AttrType::String),
    ],
};

pub static DIRECTORY: ResourceKind = ResourceKind {
    name: "directory",
    default_action: "create",
    actions: &["create", "delete", "nothing"],
    attributes: &[
        named("path"),
        opt("mode", AttrType::String),
        opt("owner", AttrType::String),
        opt("group", AttrType::String),
        with_default("create_parents", AttrType::Bool, AttrDefault::Bool(false)),
        with_default("recursive_delete", AttrType::Bool, AttrDefault::Bool(false)),
    ],
};

pub static EXECUTE: ResourceKind = ResourceKind {
    name: "execute",
    default_action: "run",
    actions: &["run", "nothing"],
    attributes: &[
        named("command"),
        opt("user", AttrType::String),
        opt("cwd", AttrType::String),
        opt("environment", AttrType::Object),
        opt("creates", AttrType::String),
        opt("not_if", AttrType::String),
        opt("only_if", AttrType::String),
        opt("timeout", AttrType::Integer),
        with_default("returns", AttrType::List, AttrDefault::IntList(&[0])),
    ],
};

pub static PACKAGE: ResourceKind = ResourceKind {
    name: "package",
    default_action: "install",
    actions: &["install", "remove", "nothing"],
    attributes: &[named("package_name"), opt("version", AttrType::String)],
};

pub static SERVICE: ResourceKind = ResourceKind {
    name: "service",
    default_action: "start",
    actions: &["start", "stop", "restart", "reload", "nothing"],
    attributes: &[
        named("service_name"),
        opt("status_command", AttrType::String),
        // Only used by the tracked-process provider.
        opt("command", AttrType::String),
        opt("user", AttrType::String),
    ],
};

pub static USER: ResourceKind = ResourceKind {
    name: "user",
    default_action: "create",
    actions: &["create", "remove", "nothing"],
    attributes: &[
        named("username"),
        opt("uid", AttrType::Integer),
        opt("gid", AttrType::String),
        opt("groups", AttrType::List),
        opt("home", AttrType::String),
        opt("shell", AttrType::String),
        with_default("system", AttrType::Bool, AttrDefault::Bool(false)),
    ],
};

/// Attributes every kind accepts.
pub static COMMON: &[AttributeSpec] = &[
    with_default("tries", AttrType::Integer, AttrDefault::Int(1)),
    with_default("try_sleep", AttrType::Integer, AttrDefault::Int(0)),
];

pub static ALL: &[&ResourceKind] = &[&FILE, &DIRECTORY, &EXECUTE, &PACKAGE, &SERVICE, &USER];
