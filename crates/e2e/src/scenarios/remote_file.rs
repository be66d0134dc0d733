//! Out-of-band file checks on the primary lab machine

use std::sync::Arc;

use futures::future::BoxFuture;
use futures::FutureExt;

use twinrun_common::{random_hex, unique_name, Result};

use super::{add_cleanup, add_step, require_ssh, ScenarioOptions};
use crate::context::{ensure, ExecutionContext};
use crate::scenario::Suite;
use crate::ssh::quote;

const RANDOM_SIZE_KB: u64 = 64;

#[derive(Debug)]
struct RemoteFiles {
    dir: String,
    content: String,
}

impl RemoteFiles {
    fn text_path(&self) -> String {
        format!("{}/payload.txt", self.dir)
    }

    fn random_path(&self) -> String {
        format!("{}/random.bin", self.dir)
    }
}

const CASES: [&str; 5] = [
    "write file",
    "checksum matches written content",
    "random file has requested size",
    "directory lists both files",
    "remove file",
];

const STORAGE_POOL_CASE: &str = "storage pools listed on machine";

pub fn remote_file_roundtrip(options: &ScenarioOptions) -> Suite {
    let mut suite = Suite::new("remote file roundtrip");

    if !options.ssh_validation {
        for name in CASES {
            suite.skip(name, "requires an SSH-reachable machine");
        }
        suite.skip(STORAGE_POOL_CASE, "requires an SSH-reachable machine");
        return suite;
    }

    let files = Arc::new(RemoteFiles {
        dir: format!("/tmp/{}", unique_name("twinrun-files")),
        content: format!("twinrun {}\n", random_hex(16)),
    });

    add_step(&mut suite, CASES[0], &files, write_file);
    add_step(&mut suite, CASES[1], &files, checksum_matches);
    add_step(&mut suite, CASES[2], &files, random_file_size);
    add_step(&mut suite, CASES[3], &files, directory_listing);
    add_step(&mut suite, CASES[4], &files, remove_file);
    if options.storage_pool {
        add_step(&mut suite, STORAGE_POOL_CASE, &files, storage_pools_listed);
    } else {
        suite.skip(STORAGE_POOL_CASE, "E2E_CEPH_NODES not set");
    }

    add_cleanup(&mut suite, &files, remove_dir);
    suite
}

fn write_file<'a>(files: Arc<RemoteFiles>, ctx: &'a ExecutionContext) -> BoxFuture<'a, Result<()>> {
    async move {
        let ssh = require_ssh(ctx)?;
        let mkdir = ssh.exec(&format!("mkdir -p {}", quote(&files.dir))).await;
        ensure(mkdir.success(), || format!("mkdir {} failed: {}", files.dir, mkdir.stderr()))?;
        let path = files.text_path();
        let written = ssh.write_file(&path, &files.content).await;
        ensure(written, || format!("could not write {}", path))?;
        ensure(ssh.file_exists(&path).await, || format!("{} missing after write", path))
    }
    .boxed()
}

fn checksum_matches<'a>(files: Arc<RemoteFiles>, ctx: &'a ExecutionContext) -> BoxFuture<'a, Result<()>> {
    async move {
        let ssh = require_ssh(ctx)?;
        let path = files.text_path();
        let same = ssh.verify_content(&path, files.content.as_bytes()).await;
        ensure(same, || format!("remote checksum of {} differs", path))
    }
    .boxed()
}

fn random_file_size<'a>(files: Arc<RemoteFiles>, ctx: &'a ExecutionContext) -> BoxFuture<'a, Result<()>> {
    async move {
        let ssh = require_ssh(ctx)?;
        let path = files.random_path();
        ensure(ssh.create_random_file(&path, RANDOM_SIZE_KB).await, || {
            format!("could not create {}", path)
        })?;
        let size = ssh.file_size(&path).await;
        ensure(size == Some(RANDOM_SIZE_KB * 1024), || {
            format!("{} has size {:?}, expected {}", path, size, RANDOM_SIZE_KB * 1024)
        })
    }
    .boxed()
}

fn directory_listing<'a>(files: Arc<RemoteFiles>, ctx: &'a ExecutionContext) -> BoxFuture<'a, Result<()>> {
    async move {
        let ssh = require_ssh(ctx)?;
        let entries = ssh.list_dir(&files.dir).await;
        let both = ["payload.txt", "random.bin"]
            .iter()
            .all(|name| entries.iter().any(|e| e == name));
        ensure(both, || format!("{} lists {:?}", files.dir, entries))
    }
    .boxed()
}

fn remove_file<'a>(files: Arc<RemoteFiles>, ctx: &'a ExecutionContext) -> BoxFuture<'a, Result<()>> {
    async move {
        let ssh = require_ssh(ctx)?;
        let path = files.text_path();
        ensure(ssh.remove_file(&path).await, || format!("rm {} failed", path))?;
        ensure(!ssh.file_exists(&path).await, || format!("{} still present", path))
    }
    .boxed()
}

fn storage_pools_listed<'a>(
    _files: Arc<RemoteFiles>,
    ctx: &'a ExecutionContext,
) -> BoxFuture<'a, Result<()>> {
    async move {
        let ssh = require_ssh(ctx)?;
        let pools = ssh.exec("sudo ceph osd pool ls").await;
        ensure(pools.success(), || format!("ceph osd pool ls failed: {}", pools.stderr().trim()))?;
        ensure(!pools.lines().is_empty(), || format!("no storage pools on {}", ssh.host()))
    }
    .boxed()
}

fn remove_dir<'a>(files: Arc<RemoteFiles>, ctx: &'a ExecutionContext) -> BoxFuture<'a, Result<()>> {
    async move {
        let ssh = require_ssh(ctx)?;
        ssh.exec(&format!("rm -rf {}", quote(&files.dir))).await;
        Ok(())
    }
    .boxed()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn without_ssh_every_case_is_a_static_skip() {
        let suite = remote_file_roundtrip(&ScenarioOptions::default());
        let mut expected = CASES.to_vec();
        expected.push(STORAGE_POOL_CASE);
        assert_eq!(suite.names(), expected);
    }

    #[test]
    fn storage_pool_case_needs_the_host_set() {
        let options = ScenarioOptions {
            ssh_validation: true,
            machine_address: Some("10.0.0.11".into()),
            ..Default::default()
        };
        assert_eq!(remote_file_roundtrip(&options).len(), CASES.len() + 1);

        let pooled = remote_file_roundtrip(&options.clone().with_storage_pool(true));
        assert_eq!(pooled.names().last(), Some(&STORAGE_POOL_CASE));
    }
}
