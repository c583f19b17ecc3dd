use log::{trace, warn};

use crate::device::{Device, TaskLists};
use crate::file::Priority;
use crate::stream::Task;

impl Device {
    /// Finds the next task for which an I/O request should be issued, and the
    /// operation's deadline for low-level heuristics.
    ///
    /// Starving tasks (deadline zero) win by priority, ties broken by the
    /// longest time since their last transfer; otherwise the smallest
    /// effective deadline wins. Tasks actually signalled for scheduling beat
    /// merely-eligible ones. Caching tasks only run when no normal task is
    /// ready.
    pub(crate) fn find_next_task(&self) -> Option<(Task, f32)> {
        let mut lists = self.tasks.lock();

        self.stamp_time();

        // When memory is full, no automatic stream can be served until a
        // block frees up; only look for a pending standard stream.
        if self.cannot_schedule_auto_streams() {
            return self.schedule_std_only(&mut lists);
        }

        let now = self.time_ms();
        let mut best: Option<(Task, f32, bool)> = None;

        let mut i = 0;
        while i < lists.tasks.len() {
            let task = lists.tasks[i].clone();

            if task.common().to_be_destroyed() {
                if task.can_be_destroyed() {
                    lists.tasks.remove(i);
                    task.instant_destroy();
                } else {
                    // Not ready to be destroyed: wait until next turn.
                    i += 1;
                }
                continue;
            }
            if !task.common().ready_for_io() {
                i += 1;
                continue;
            }

            let deadline = task.effective_deadline_ms();
            let signalled = task.common().requires_scheduling();

            match &mut best {
                None => best = Some((task, deadline, signalled)),
                Some((best_task, best_deadline, best_signalled)) => {
                    if !*best_signalled && signalled {
                        // First task that actually requires action from the
                        // scheduler: pick it.
                        *best_task = task;
                        *best_deadline = deadline;
                        *best_signalled = true;
                    } else if !*best_signalled || signalled {
                        if deadline == 0.0 {
                            // Starvation mode: user throughput is greater
                            // than the low-level bandwidth. Choose by
                            // priority among the starving.
                            if task.common().priority() > best_task.common().priority()
                                || *best_deadline > 0.0
                            {
                                *best_deadline = deadline;
                                *best_signalled = task.common().requires_scheduling();
                                *best_task = task;
                            } else if task.common().priority() == best_task.common().priority()
                                && task.common().time_since_last_transfer_ms(now)
                                    > best_task.common().time_since_last_transfer_ms(now)
                            {
                                // Same priority: choose the one that has
                                // waited the most.
                                *best_deadline = deadline;
                                *best_signalled = task.common().requires_scheduling();
                                *best_task = task;
                            }
                        } else if deadline < *best_deadline {
                            // The low-level has enough bandwidth; take the
                            // bet that this transfer completes fast enough to
                            // service the others on the next pass.
                            *best_deadline = deadline;
                            *best_signalled = task.common().requires_scheduling();
                            *best_task = task;
                        }
                    }
                }
            }
            i += 1;
        }

        match best {
            Some((task, deadline, true)) => {
                trace!(
                    "scheduling stream {} (deadline {:.2} ms)",
                    task.common().stream_id,
                    deadline
                );
                Some((task, deadline))
            }
            _ => self
                .find_next_caching_task(&mut lists)
                .map(|task| (task, 0.0)),
        }
    }

    /// Restriction of the scheduler to standard streams, used when there is
    /// no memory left for automatic streams. Standard streams that are ready
    /// for I/O are always signalled.
    fn schedule_std_only(&self, lists: &mut TaskLists) -> Option<(Task, f32)> {
        let now = self.time_ms();
        let mut best: Option<(Task, f32)> = None;

        let mut i = 0;
        while i < lists.tasks.len() {
            let task = lists.tasks[i].clone();

            if task.common().to_be_destroyed() {
                if task.can_be_destroyed() {
                    lists.tasks.remove(i);
                    task.instant_destroy();
                } else {
                    i += 1;
                }
                continue;
            }
            if !task.is_std() || !task.common().ready_for_io() {
                i += 1;
                continue;
            }

            let deadline = task.effective_deadline_ms();
            match &mut best {
                None => best = Some((task, deadline)),
                Some((best_task, best_deadline)) => {
                    if deadline == 0.0 {
                        if task.common().priority() > best_task.common().priority()
                            || *best_deadline > 0.0
                        {
                            *best_deadline = deadline;
                            *best_task = task;
                        } else if task.common().priority() == best_task.common().priority()
                            && task.common().time_since_last_transfer_ms(now)
                                > best_task.common().time_since_last_transfer_ms(now)
                        {
                            *best_deadline = deadline;
                            *best_task = task;
                        }
                    } else if deadline < *best_deadline {
                        *best_deadline = deadline;
                        *best_task = task;
                    }
                }
            }
            i += 1;
        }

        best
    }

    /// Second scheduling pass: picks the highest-priority caching stream
    /// needing more data, under the pinned-bytes budget. Lower-priority
    /// caching streams are bumped to make room; if the budget still cannot
    /// fit the candidate, nothing is scheduled this tick.
    pub(crate) fn find_next_caching_task(&self, lists: &mut TaskLists) -> Option<Task> {
        let mut current_pinned: u32 = 0;
        let mut stream_destroyed = false;

        let mut i = 0;
        while i < lists.caching.len() {
            let task = lists.caching[i].clone();
            if task.common().to_be_destroyed() && task.can_be_destroyed() {
                lists.caching.remove(i);
                task.instant_destroy();
                stream_destroyed = true;
                continue;
            }
            current_pinned += task.virtual_buffering();
            i += 1;
        }

        // Find the highest-priority task that needs servicing.
        let mut to_schedule: Option<Task> = None;
        for task in &lists.caching {
            if stream_destroyed {
                // A stream went away: caching streams stopped at the memory
                // limit may fit in now.
                task.start_caching();
            }
            if task.common().requires_scheduling() {
                let better = match &to_schedule {
                    None => true,
                    Some(best) => task.common().priority() > best.common().priority(),
                };
                if better {
                    to_schedule = Some(task.clone());
                }
            }
        }

        let mut scheduled = to_schedule;
        if let Some(candidate) = &scheduled {
            let mem_needed = candidate
                .nominal_buffering()
                .saturating_sub(candidate.virtual_buffering());

            if current_pinned + mem_needed > self.max_cache_pinned_bytes() {
                // Bump the lowest-priority caching stream below the
                // candidate, repeatedly, until the budget fits.
                loop {
                    let mut to_bump: Option<Task> = None;
                    for task in &lists.caching {
                        if task.virtual_buffering() > 0
                            && task.common().priority() < candidate.common().priority()
                            && match &to_bump {
                                None => true,
                                Some(bump) => task.common().priority() < bump.common().priority(),
                            }
                        {
                            to_bump = Some(task.clone());
                        }
                    }
                    match to_bump {
                        Some(bump) => {
                            current_pinned =
                                current_pinned.saturating_sub(bump.stop_caching(mem_needed));
                            if current_pinned + mem_needed <= self.max_cache_pinned_bytes() {
                                break;
                            }
                        }
                        None => break,
                    }
                }

                if current_pinned + mem_needed > self.max_cache_pinned_bytes() {
                    // Could not free enough: do not schedule any caching
                    // stream this tick.
                    warn!("cache pin budget exhausted; parking caching stream");
                    candidate.stop_caching(0);
                    scheduled = None;
                }
            }
        }

        self.current_cache_pinned
            .store(current_pinned, std::sync::atomic::Ordering::Relaxed);

        scheduled
    }

    /// Reaps dead tasks on every list; optionally kills the ready task with
    /// the lowest priority strictly below `priority` to make room for a new
    /// stream.
    pub(crate) fn force_cleanup(&self, kill_lowest_priority_task: bool, priority: Priority) {
        let caching_killed =
            self.force_task_list_cleanup(kill_lowest_priority_task, priority, true);
        self.force_task_list_cleanup(
            kill_lowest_priority_task && !caching_killed,
            priority,
            false,
        );
    }

    fn force_task_list_cleanup(
        &self,
        kill_lowest_priority_task: bool,
        priority: Priority,
        caching: bool,
    ) -> bool {
        let mut lists = self.tasks.lock();
        let list = if caching {
            &mut lists.caching
        } else {
            &mut lists.tasks
        };

        let mut to_kill: Option<Task> = None;
        let mut i = 0;
        while i < list.len() {
            let task = list[i].clone();
            if task.common().to_be_destroyed() {
                if task.can_be_destroyed() {
                    list.remove(i);
                    task.instant_destroy();
                    continue;
                }
            } else if kill_lowest_priority_task
                && task.common().priority() < priority
                && task.common().ready_for_io()
                && match &to_kill {
                    None => true,
                    Some(kill) => task.common().priority() < kill.common().priority(),
                }
            {
                to_kill = Some(task.clone());
            }
            i += 1;
        }

        match to_kill {
            Some(task) => {
                warn!(
                    "force cleanup: killing stream {} (priority {})",
                    task.common().stream_id,
                    task.common().priority()
                );
                task.kill();
                true
            }
            None => false,
        }
    }
}
