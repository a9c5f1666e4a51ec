impl SyncEngine {
    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.inner.events.subscribe()
    }

    pub fn queue(&self) -> &TransferQueue {
        &self.inner.queue
    }

    /// The manager of the bound target.
    pub fn connection(&self) -> Option<ConnectionManager> {
        self.bound().map(|bound| bound.manager)
    }

    /// Jobs waiting for the connection to come up.
    pub fn parked_jobs(&self) -> usize {
        lock(&self.inner.offline).parked.len()
    }

    /// Root-relative path for `path`, ignoring paths outside the root and
    /// paths the engine wrote itself a moment ago.
    fn accept(&self, bound: &Bound, path: &Path) -> Option<String> {
        let relative = relative_path(&bound.target.local_root, path)?;
        let absolute = local_path_for(&bound.target.local_root, &relative).ok()?;
        if self.inner.suppressor.is_suppressed(&absolute) {
            debug!("ignoring self-inflicted change to {}", relative);
            return None;
        }
        Some(relative)
    }

    /// Debounced reaction to a change notification. Returns whether the
    /// notification was accepted.
    pub fn schedule_sync_file(&self, path: &Path, direction: Direction) -> bool {
        let Some(bound) = self.bound() else {
            debug!("no target bound; dropping notification for {}", path.display());
            return false;
        };
        let Some(relative) = self.accept(&bound, path) else {
            return false;
        };
        let filter = self.filter();
        let weak = Arc::downgrade(&self.inner);
        match direction {
            Direction::Push => {
                if !filter.should_push(&relative) {
                    return false;
                }
                self.index().mark_pending(&relative, PendingChange::Upsert);
                self.set_status(&relative, PathStatus::Pending);
                let key = relative.clone();
                self.inner.debouncer.schedule(&key, async move {
                    if let Some(inner) = weak.upgrade() {
                        let engine = SyncEngine::from_inner(inner);
                        if let Some(job) = engine.push_job(&bound, &relative, Priority::Normal) {
                            engine.submit(&bound, job);
                        }
                    }
                });
            }
            Direction::Pull => {
                if !filter.should_sync(&relative) {
                    return false;
                }
                let key = format!("{PULL_KEY_PREFIX}{relative}");
                self.inner.debouncer.schedule(&key, async move {
                    if let Some(inner) = weak.upgrade() {
                        let engine = SyncEngine::from_inner(inner);
                        if let Some(job) = engine.download_job(&bound, &relative, Priority::Normal) {
                            engine.submit(&bound, job);
                        }
                    }
                });
            }
        }
        true
    }

    /// Debounced reaction to a local delete notification.
    pub fn schedule_delete(&self, path: &Path) -> bool {
        let Some(bound) = self.bound() else {
            return false;
        };
        let Some(relative) = self.accept(&bound, path) else {
            return false;
        };
        if !self.filter().should_push(&relative) {
            return false;
        }
        self.index().mark_pending(&relative, PendingChange::Delete);
        self.set_status(&relative, PathStatus::Pending);
        let weak = Arc::downgrade(&self.inner);
        let key = relative.clone();
        self.inner.debouncer.schedule(&key, async move {
            if let Some(inner) = weak.upgrade() {
                let engine = SyncEngine::from_inner(inner);
                if let Some(job) = engine.delete_job(&bound, &relative, Priority::Normal) {
                    engine.submit(&bound, job);
                }
            }
        });
        true
    }

    /// Local rename. Falls back to upload or delete when only one side of
    /// the rename is syncable.
    pub fn schedule_rename(&self, from: &Path, to: &Path) -> bool {
        let Some(bound) = self.bound() else {
            return false;
        };
        let filter = self.filter();
        let source = relative_path(&bound.target.local_root, from)
            .filter(|relative| filter.should_push(relative));
        let destination = self
            .accept(&bound, to)
            .filter(|relative| filter.should_push(relative));

        match (source, destination) {
            (Some(source), Some(destination)) => {
                self.inner.debouncer.cancel(&source);
                self.inner.debouncer.cancel(&destination);
                self.set_status(&destination, PathStatus::Pending);
                match self.rename_job(&bound, &source, &destination) {
                    Some(job) => {
                        self.submit(&bound, job);
                        true
                    }
                    None => false,
                }
            }
            (None, Some(_)) => self.schedule_sync_file(to, Direction::Push),
            (Some(_), None) => self.schedule_delete(from),
            (None, None) => false,
        }
    }

    /// Pushes every path in the pending-change ledger and waits for the
    /// queue to drain.
    pub async fn sync_all(&self) -> Result<SyncReport, EngineError> {
        let bound = self.require_bound()?;
        // Pending pushes are rebuilt from the ledger below; pulls keep their timers.
        self.inner.debouncer.cancel_matching(|key| !key.starts_with(PULL_KEY_PREFIX));
        let filter = self.filter();
        let pending = self.index().pending_changes();
        info!("pushing {} pending changes", pending.len());

        let mut jobs = Vec::new();
        for (relative, change) in pending {
            if !filter.should_push(&relative) {
                self.index().clear_pending(&relative);
                self.set_status(&relative, PathStatus::None);
                continue;
            }
            let job = match change {
                PendingChange::Upsert => self.push_job(&bound, &relative, Priority::Normal),
                PendingChange::Delete => self.delete_job(&bound, &relative, Priority::Normal),
            };
            jobs.extend(job);
        }
        Ok(self.run_tracked(&bound, jobs).await)
    }

    /// Downloads every remote file that passes the exclusions.
    pub async fn sync_pull(&self) -> Result<SyncReport, EngineError> {
        let bound = self.require_bound()?;
        let filter = self.filter();
        let cancel = CancellationToken::new();
        let root = bound.target.remote_root.clone();
        let files = {
            let call = RemoteCall::open(&bound.manager, &cancel).await?;
            let mut files = Vec::new();
            let mut stack = vec![root.clone()];
            while let Some(dir) = stack.pop() {
                let entries = call.run(call.session().readdir(&dir)).await?;
                for entry in entries {
                    let remote = pisync_core::join_remote(&dir, &entry.name);
                    let Some(relative) = relative_remote(&root, &remote) else {
                        continue;
                    };
                    if !filter.should_sync(&relative) {
                        continue;
                    }
                    if entry.is_dir {
                        let local = local_path_for(&bound.target.local_root, &relative)?;
                        tokio::fs::create_dir_all(&local).await?;
                        stack.push(remote);
                    } else {
                        files.push(relative);
                    }
                }
            }
            files
        };
        info!("pulling {} remote files", files.len());

        let jobs = files
            .iter()
            .filter_map(|relative| self.download_job(&bound, relative, Priority::Low))
            .collect();
        Ok(self.run_tracked(&bound, jobs).await)
    }

    /// Uploads `path`, or every eligible file below it when it is a
    /// directory. Conflict detection still applies.
    pub async fn force_push(&self, path: &Path) -> Result<SyncReport, EngineError> {
        let bound = self.require_bound()?;
        let root = bound.target.local_root.clone();
        let start = if path.is_absolute() {
            path.to_path_buf()
        } else {
            root.join(path)
        };
        if !start.starts_with(&root) {
            return Err(EngineError::OutsideRoot(start));
        }
        let filter = self.filter();

        let meta = tokio::fs::metadata(&start).await?;
        if !meta.is_dir() {
            let relative = relative_path(&root, &start)
                .ok_or_else(|| EngineError::OutsideRoot(start.clone()))?;
            if !filter.should_push(&relative) {
                return Ok(SyncReport::default());
            }
            let jobs = self.push_job(&bound, &relative, Priority::Normal).into_iter().collect();
            return Ok(self.run_tracked(&bound, jobs).await);
        }

        let walk_root = root.clone();
        let files = tokio::task::spawn_blocking(move || collect_local_files(&walk_root, &start, &filter))
            .await
            .map_err(|err| std::io::Error::other(err.to_string()))??;
        info!("force pushing {} files", files.len());

        let jobs = files
            .iter()
            .filter_map(|relative| self.push_job(&bound, relative, Priority::Low))
            .collect();
        Ok(self.run_tracked(&bound, jobs).await)
    }

    pub fn status(&self, path: &Path) -> PathStatus {
        let Some(bound) = self.bound() else {
            return PathStatus::None;
        };
        match relative_path(&bound.target.local_root, path) {
            Some(relative) => self.index().status(&relative),
            None => PathStatus::None,
        }
    }

    pub fn conflicts(&self) -> Vec<ConflictArtifact> {
        self.index().conflicts().to_vec()
    }

    /// Marks the conflict on `path` as handled by the user. The baseline is
    /// dropped so the next push of `path` overwrites the remote copy.
    pub fn resolve_conflict(&self, path: &Path) -> bool {
        let Some(bound) = self.bound() else {
            return false;
        };
        let Some(relative) = relative_path(&bound.target.local_root, path) else {
            return false;
        };
        let source = match local_path_for(&bound.target.local_root, &relative) {
            Ok(source) => source,
            Err(_) => return false,
        };
        let resolved = {
            let mut index = self.index();
            let resolved = index.resolve_conflicts(&source);
            if resolved {
                index.remove_signatures(&relative);
            }
            resolved
        };
        if resolved {
            info!("conflict on {} resolved", relative);
            self.set_status(&relative, PathStatus::None);
        }
        resolved
    }

    /// Stops timers, cancels queued work and closes every connection.
    pub async fn shutdown(&self) {
        self.inner.debouncer.cancel_all();
        let binding = lock(&self.inner.binding).take();
        if let Some(binding) = binding {
            binding.listener.abort();
        }
        self.drop_target_work();
        if let Some(listener) = lock(&self.inner.queue_listener).take() {
            listener.abort();
        }
        self.inner.registry.dispose_all().await;
        info!("sync engine stopped");
    }

    /// Submits `jobs` and waits until each one reached a terminal state
    /// and the queue drained.
    async fn run_tracked(&self, bound: &Bound, jobs: Vec<TransferJob>) -> SyncReport {
        let conflicts_before = self.index().conflicts().len();
        let mut events = self.inner.queue.subscribe();
        let mut outstanding: HashSet<u64> = jobs.iter().map(|job| job.id).collect();
        for job in jobs {
            self.submit(bound, job);
        }

        let mut report = SyncReport::default();
        while !outstanding.is_empty() {
            match events.recv().await {
                Ok(QueueEvent::JobCompleted(job)) if outstanding.remove(&job.id) => {
                    report.completed += 1;
                }
                Ok(QueueEvent::JobFailed { job, .. }) if outstanding.remove(&job.id) => {
                    report.failed += 1;
                }
                Ok(QueueEvent::JobCancelled(job)) if outstanding.remove(&job.id) => {
                    report.cancelled += 1;
                }
                Ok(_) => {}
                Err(RecvError::Lagged(skipped)) => {
                    warn!("bulk sync missed {} queue events; waiting for drain", skipped);
                    break;
                }
                Err(RecvError::Closed) => break,
            }
        }
        self.inner.queue.wait_idle().await;
        report.conflicts = self
            .index()
            .conflicts()
            .len()
            .saturating_sub(conflicts_before);
        report
    }
}

/// Files below `start` that pass `filter`, pruning excluded directories.
fn collect_local_files(
    root: &Path,
    start: &Path,
    filter: &PathFilter,
) -> Result<Vec<String>, std::io::Error> {
    let mut files = Vec::new();
    let walker = walkdir::WalkDir::new(start)
        .follow_links(false)
        .into_iter()
        .filter_entry(|entry| match relative_path(root, entry.path()) {
            Some(relative) => !filter.is_excluded(&relative),
            None => entry.depth() == 0,
        });
    for entry in walker {
        let entry = entry.map_err(std::io::Error::other)?;
        if !entry.file_type().is_file() {
            continue;
        }
        if let Some(relative) = relative_path(root, entry.path())
            && filter.should_push(&relative)
        {
            files.push(relative);
        }
    }
    files.sort();
    Ok(files)
}
