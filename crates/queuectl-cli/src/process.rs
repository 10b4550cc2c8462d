use std::path::Path;

/// Spawn `count` copies of the current binary, each re-invoked with the
/// hidden `worker run-one --worker-id <id>` subcommand so the worker loop
/// runs in its own OS process, per the spec's "independent OS process"
/// requirement — no in-process thread pool substitutes for this.
pub fn spawn_workers(count: u32, state_dir: &Path) -> anyhow::Result<Vec<u32>> {
    let exe = std::env::current_exe()?;
    let mut pids = Vec::with_capacity(count as usize);

    for i in 0..count {
        let worker_id = format!(
            "worker-{}-{i}-{}",
            std::process::id(),
            chrono::Utc::now().timestamp()
        );
        let child = std::process::Command::new(&exe)
            .arg("--state-dir")
            .arg(state_dir)
            .arg("worker")
            .arg("run-one")
            .arg("--worker-id")
            .arg(&worker_id)
            .spawn()?;
        pids.push(child.id());
        println!("Started worker {} (PID: {})", i + 1, child.id());
    }

    Ok(pids)
}
