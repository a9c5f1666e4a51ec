impl SyncEngine {
    fn job_paths(&self, bound: &Bound, relative: &str) -> Option<(PathBuf, String)> {
        let local = local_path_for(&bound.target.local_root, relative);
        let remote = remote_path_for(&bound.target.remote_root, relative);
        match (local, remote) {
            (Ok(local), Ok(remote)) => Some((local, remote)),
            (Err(err), _) | (_, Err(err)) => {
                warn!("skipping {}: {}", relative, err);
                None
            }
        }
    }

    /// Wraps `op` so the job holds only a weak handle on the engine.
    fn build_job<F, Fut>(
        &self,
        kind: JobKind,
        local: PathBuf,
        remote: String,
        priority: Priority,
        op: F,
    ) -> TransferJob
    where
        F: Fn(SyncEngine, JobContext) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<(), JobError>> + Send + 'static,
    {
        let weak = Arc::downgrade(&self.inner);
        TransferJob::new(kind, remote, move |ctx| {
            let run = weak
                .upgrade()
                .map(|inner| op(SyncEngine::from_inner(inner), ctx));
            async move {
                match run {
                    Some(run) => run.await,
                    None => Err(JobError::Cancelled),
                }
            }
        })
        .with_local_path(local)
        .with_priority(priority)
        .with_max_retries(self.settings().max_retries)
    }

    /// Upload for a file, `CreateDir` for a directory.
    fn push_job(&self, bound: &Bound, relative: &str, priority: Priority) -> Option<TransferJob> {
        let (local, remote) = self.job_paths(bound, relative)?;
        let mark = self.index().pending_mark(relative);
        let is_dir = std::fs::metadata(&local).is_ok_and(|meta| meta.is_dir());
        let target = bound.clone();
        let path = relative.to_string();

        if is_dir {
            return Some(self.build_job(
                JobKind::CreateDir,
                local,
                remote,
                Priority::High,
                move |engine, ctx| {
                    let bound = target.clone();
                    let relative = path.clone();
                    async move { engine.run_mkdir(&bound, &relative, mark, &ctx).await }
                },
            ));
        }
        let temp = super::transfer::temp_remote_path(&remote);
        let job = self.build_job(JobKind::Upload, local, remote, priority, move |engine, ctx| {
            let bound = target.clone();
            let relative = path.clone();
            async move { engine.run_upload(&bound, &relative, mark, &ctx).await }
        });
        Some(job.with_temp_paths(None, Some(temp)))
    }

    fn download_job(&self, bound: &Bound, relative: &str, priority: Priority) -> Option<TransferJob> {
        let (local, remote) = self.job_paths(bound, relative)?;
        let temp = super::transfer::temp_local_path(&local);
        let target = bound.clone();
        let path = relative.to_string();
        let job = self.build_job(JobKind::Download, local, remote, priority, move |engine, ctx| {
            let bound = target.clone();
            let relative = path.clone();
            async move { engine.run_download(&bound, &relative, &ctx).await }
        });
        Some(job.with_temp_paths(Some(temp), None))
    }

    fn delete_job(&self, bound: &Bound, relative: &str, priority: Priority) -> Option<TransferJob> {
        let (local, remote) = self.job_paths(bound, relative)?;
        self.cancel_kinds(&remote, &[JobKind::Upload, JobKind::CreateDir]);
        let mark = self.index().pending_mark(relative);
        let target = bound.clone();
        let path = relative.to_string();
        Some(self.build_job(JobKind::Delete, local, remote, priority, move |engine, ctx| {
            let bound = target.clone();
            let relative = path.clone();
            async move { engine.run_delete(&bound, &relative, mark, &ctx).await }
        }))
    }

    fn rename_job(&self, bound: &Bound, source: &str, destination: &str) -> Option<TransferJob> {
        let (_, from) = self.job_paths(bound, source)?;
        let (local, _) = self.job_paths(bound, destination)?;
        let target = bound.clone();
        let paths = (source.to_string(), destination.to_string());
        Some(self.build_job(JobKind::Rename, local, from, Priority::Normal, move |engine, ctx| {
            let bound = target.clone();
            let (source, destination) = paths.clone();
            async move { engine.run_rename(&bound, &source, &destination, &ctx).await }
        }))
    }

    /// Records the baseline and reports `Synced` unless a newer
    /// notification arrived while the job ran.
    fn finish_sync(&self, relative: &str, signature: Option<SyncSignature>, mark: Option<u64>) {
        let settled = {
            let mut index = self.index();
            if let Some(signature) = signature {
                index.record_signature(relative, signature);
            }
            index.clear_pending_if(relative, mark);
            index.pending(relative).is_none()
        };
        if settled {
            self.set_status(relative, PathStatus::Synced);
        }
    }

    async fn ensure_remote_parents(
        &self,
        call: &RemoteCall<'_>,
        bound: &Bound,
        relative: &str,
    ) -> Result<(), JobError> {
        for dir in remote_ancestors(&bound.target.remote_root, relative)? {
            let known = self.index().knows_remote_dir(&dir);
            if known {
                continue;
            }
            call.run(call.session().mkdir(&dir)).await?;
            self.index().remember_remote_dir(&dir);
        }
        Ok(())
    }

    async fn run_upload(
        &self,
        bound: &Bound,
        relative: &str,
        mark: Option<u64>,
        ctx: &JobContext,
    ) -> Result<(), JobError> {
        let local = local_path_for(&bound.target.local_root, relative)?;
        let meta = match tokio::fs::metadata(&local).await {
            Ok(meta) => meta,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                debug!("{} vanished before upload", relative);
                let settled = {
                    let mut index = self.index();
                    index.clear_pending_if(relative, mark);
                    index.pending(relative).is_none()
                };
                if settled {
                    self.set_status(relative, PathStatus::None);
                }
                return Ok(());
            }
            Err(err) => return Err(err.into()),
        };
        if meta.is_dir() {
            return self.run_mkdir(bound, relative, mark, ctx).await;
        }

        let remote = remote_path_for(&bound.target.remote_root, relative)?;
        let call = RemoteCall::open(&bound.manager, &ctx.cancel).await?;
        self.ensure_remote_parents(&call, bound, relative).await?;

        let local_sig = SyncSignature::from_metadata(&meta);
        let remote_stat = call.run(call.session().stat(&remote)).await?;
        if remote_stat.is_some_and(|stat| stat.is_dir) {
            return Err(JobError::Transfer(format!(
                "{remote} is a directory on the remote"
            )));
        }
        let remote_sig = remote_stat.map(SyncSignature::from);
        let baseline = self.index().signature(relative);

        match decide_push(baseline.as_ref(), &local_sig, remote_sig.as_ref()) {
            PushDecision::InSync => debug!("{} already in sync", relative),
            PushDecision::Transfer => {
                upload_atomic(&call, &local, &remote).await?;
                debug!("uploaded {} -> {}", relative, remote);
            }
            PushDecision::Conflict => {
                self.preserve_conflict(&call, &local, &remote).await?;
                {
                    let mut index = self.index();
                    index.clear_pending_if(relative, mark);
                }
                self.set_status(relative, PathStatus::Modified);
                return Ok(());
            }
        }
        self.finish_sync(relative, Some(local_sig), mark);
        Ok(())
    }

    /// Keeps both diverged copies beside the original; nothing is merged
    /// and the remote file is left untouched.
    async fn preserve_conflict(
        &self,
        call: &RemoteCall<'_>,
        local: &Path,
        remote: &str,
    ) -> Result<(), JobError> {
        let (Some(dir), Some(name)) = (local.parent(), local.file_name()) else {
            return Err(JobError::Transfer(format!(
                "cannot place conflict copies for {}",
                local.display()
            )));
        };
        let stamp = conflict_stamp(OffsetDateTime::now_utc());
        let (local_name, remote_name) = artifact_names(&name.to_string_lossy(), &stamp);
        let local_artifact = dir.join(local_name);
        let remote_artifact = dir.join(remote_name);
        self.inner.suppressor.suppress(&local_artifact);
        self.inner.suppressor.suppress(&remote_artifact);

        tokio::fs::copy(local, &local_artifact).await?;
        call.run(call.session().get(remote, &remote_artifact)).await?;
        self.inner.suppressor.suppress(&local_artifact);
        self.inner.suppressor.suppress(&remote_artifact);
        warn!(
            "conflict on {}: both sides changed, kept {} and {}",
            local.display(),
            local_artifact.display(),
            remote_artifact.display()
        );

        let artifact = ConflictArtifact {
            source_path: local.to_path_buf(),
            local_artifact,
            remote_artifact,
        };
        self.index().record_conflict(artifact.clone());
        let _ = self.inner.events.send(EngineEvent::ConflictDetected(artifact));
        Ok(())
    }

    async fn run_mkdir(
        &self,
        bound: &Bound,
        relative: &str,
        mark: Option<u64>,
        ctx: &JobContext,
    ) -> Result<(), JobError> {
        let remote = remote_path_for(&bound.target.remote_root, relative)?;
        let call = RemoteCall::open(&bound.manager, &ctx.cancel).await?;
        self.ensure_remote_parents(&call, bound, relative).await?;
        let known = self.index().knows_remote_dir(&remote);
        if !known {
            call.run(call.session().mkdir(&remote)).await?;
            self.index().remember_remote_dir(&remote);
        }
        self.finish_sync(relative, None, mark);
        Ok(())
    }

    async fn run_download(
        &self,
        bound: &Bound,
        relative: &str,
        ctx: &JobContext,
    ) -> Result<(), JobError> {
        let local = local_path_for(&bound.target.local_root, relative)?;
        let remote = remote_path_for(&bound.target.remote_root, relative)?;
        let call = RemoteCall::open(&bound.manager, &ctx.cancel).await?;

        let Some(stat) = call.run(call.session().stat(&remote)).await? else {
            debug!("{} no longer exists on the remote", relative);
            return Ok(());
        };
        if stat.is_dir {
            self.inner.suppressor.suppress(&local);
            tokio::fs::create_dir_all(&local).await?;
            return Ok(());
        }

        let remote_sig = SyncSignature::from(stat);
        let local_sig = match tokio::fs::metadata(&local).await {
            Ok(meta) if meta.is_file() => Some(SyncSignature::from_metadata(&meta)),
            _ => None,
        };
        if local_sig == Some(remote_sig) {
            debug!("{} already in sync", relative);
        } else {
            download_atomic(&call, &remote, &local, &self.inner.suppressor).await?;
            debug!("downloaded {} -> {}", remote, local.display());
        }
        self.index().record_signature(relative, remote_sig);
        self.set_status(relative, PathStatus::Synced);
        Ok(())
    }

    async fn run_delete(
        &self,
        bound: &Bound,
        relative: &str,
        mark: Option<u64>,
        ctx: &JobContext,
    ) -> Result<(), JobError> {
        let remote = remote_path_for(&bound.target.remote_root, relative)?;
        let call = RemoteCall::open(&bound.manager, &ctx.cancel).await?;

        match call.run(call.session().stat(&remote)).await? {
            None => debug!("{} already absent on the remote", relative),
            Some(stat) if stat.is_dir => {
                remove_remote_tree(&call, &remote).await?;
                self.index().forget_remote_dirs(&remote);
            }
            Some(_) => tolerate_missing(call.run(call.session().unlink(&remote)).await)?,
        }

        let settled = {
            let mut index = self.index();
            index.remove_signatures(relative);
            index.clear_pending_if(relative, mark);
            index.pending(relative).is_none()
        };
        if settled {
            self.set_status(relative, PathStatus::None);
        }
        debug!("deleted {}", remote);
        Ok(())
    }

    async fn run_rename(
        &self,
        bound: &Bound,
        source: &str,
        destination: &str,
        ctx: &JobContext,
    ) -> Result<(), JobError> {
        let from = remote_path_for(&bound.target.remote_root, source)?;
        let to = remote_path_for(&bound.target.remote_root, destination)?;
        let call = RemoteCall::open(&bound.manager, &ctx.cancel).await?;
        self.ensure_remote_parents(&call, bound, destination).await?;

        match call.run(call.session().rename(&from, &to)).await {
            Ok(()) => {}
            Err(JobError::NotFound(_)) => {
                debug!("{} missing on the remote; uploading {} instead", from, destination);
                drop(call);
                return self.run_upload(bound, destination, None, ctx).await;
            }
            Err(err) => return Err(err),
        }

        {
            let mut index = self.index();
            index.rename_signatures(source, destination);
            index.forget_remote_dirs(&from);
        }
        self.set_status(source, PathStatus::None);
        self.finish_sync(destination, None, None);
        debug!("renamed {} -> {}", from, to);
        Ok(())
    }
}

fn tolerate_missing(result: Result<(), JobError>) -> Result<(), JobError> {
    match result {
        Err(JobError::NotFound(_)) => Ok(()),
        other => other,
    }
}

/// Unlinks every file below `root`, then removes directories bottom-up.
async fn remove_remote_tree(call: &RemoteCall<'_>, root: &str) -> Result<(), JobError> {
    let mut stack = vec![root.to_string()];
    let mut dirs = Vec::new();
    while let Some(dir) = stack.pop() {
        for entry in call.run(call.session().readdir(&dir)).await? {
            let child = pisync_core::join_remote(&dir, &entry.name);
            if entry.is_dir {
                stack.push(child);
            } else {
                tolerate_missing(call.run(call.session().unlink(&child)).await)?;
            }
        }
        dirs.push(dir);
    }
    for dir in dirs.iter().rev() {
        tolerate_missing(call.run(call.session().rmdir(dir)).await)?;
    }
    Ok(())
}
