// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::sync::RwLock;

use anyhow::Result;
use sysinfo::{Pid, PidExt, ProcessExt, SystemExt};

pub fn refresh() -> Result<()> {
    let mut s = SYSTEM.write().map_err(|e| format_err!("{}", e))?;
    s.refresh();
    Ok(())
}

pub fn system_info() -> Result<SystemInfo> {
    let s = SYSTEM.read().map_err(|e| format_err!("{}", e))?;
    Ok(s.system_info())
}

pub fn processes() -> Result<Vec<ProcInfo>> {
    let mut s = SYSTEM.write().map_err(|e| format_err!("{}", e))?;
    Ok(s.processes())
}

pub fn proc_info(pid: u32) -> Result<Option<ProcInfo>> {
    let s = SYSTEM.read().map_err(|e| format_err!("{}", e))?;
    Ok(s.proc_info(pid))
}

pub fn refresh_process(pid: u32) -> Result<bool> {
    let mut s = SYSTEM.write().map_err(|e| format_err!("{}", e))?;
    Ok(s.refresh_process(pid))
}

/// Finds every live process whose command line contains `needle` (used to
/// locate a worker process from its entry-point path when the only thing
/// known about it is that path, not its pid).
pub fn find_by_command_line(needle: &str) -> Result<Vec<ProcInfo>> {
    let mut s = SYSTEM.write().map_err(|e| format_err!("{}", e))?;
    Ok(s.find_by_command_line(needle))
}

/// Sends `SIGKILL` (or the platform equivalent) to `pid` and, best-effort,
/// to any of its children discovered in the current process table snapshot.
pub fn kill_tree(pid: u32) -> Result<()> {
    let mut s = SYSTEM.write().map_err(|e| format_err!("{}", e))?;
    s.kill_tree(pid);
    Ok(())
}

lazy_static! {
    static ref SYSTEM: RwLock<System> = {
        let mut s = System::new();
        s.refresh();
        RwLock::new(s)
    };
}

struct System {
    system: sysinfo::System,
}

// Mark our private `System` wrapper as `Send` and `Sync`, we can make a global.
//
// We may mark the type as `Sync` because we will wrap a `RwLock` around the only instance.
// We will synchronize access to the instance within the functions exported from this module.
//
// We may mark the type as `Send` because we only have one global instance, which is private,
// and we will not move it across threads. It is not actually `Send`, and must not be exported.
unsafe impl Send for System {}
unsafe impl Sync for System {}

impl System {
    pub fn new() -> Self {
        let mut system = sysinfo::System::new_all();
        system.refresh_all();

        Self { system }
    }

    pub fn refresh(&mut self) {
        self.system.refresh_all();
    }

    pub fn refresh_process(&mut self, pid: u32) -> bool {
        self.system.refresh_process(Pid::from_u32(pid))
    }

    pub fn system_info(&self) -> SystemInfo {
        let system = &self.system;

        let total_memory_kib = system.total_memory();
        let used_memory_kib = system.used_memory();
        let free_memory_kib = system.free_memory();
        let total_swap_kib = system.total_swap();
        let used_swap_kib = system.used_swap();
        let uptime = system.uptime();

        let load_avg = system.load_average();
        let load_avg_1min = load_avg.one;
        let load_avg_5min = load_avg.five;
        let load_avg_15min = load_avg.fifteen;

        let cpu_usage = system.global_cpu_info().cpu_usage();

        SystemInfo {
            total_memory_kib,
            used_memory_kib,
            free_memory_kib,
            total_swap_kib,
            used_swap_kib,
            uptime,
            load_avg_1min,
            load_avg_5min,
            load_avg_15min,
            cpu_usage,
        }
    }

    pub fn processes(&mut self) -> Vec<ProcInfo> {
        self.system.refresh_processes();

        self.system
            .processes()
            .values()
            .map(ProcInfo::from_process)
            .collect()
    }

    pub fn proc_info(&self, pid: u32) -> Option<ProcInfo> {
        self.system
            .process(Pid::from_u32(pid))
            .map(ProcInfo::from_process)
    }

    pub fn find_by_command_line(&mut self, needle: &str) -> Vec<ProcInfo> {
        self.system.refresh_processes();

        self.system
            .processes()
            .values()
            .filter(|p| p.cmd().iter().any(|arg| arg.contains(needle)))
            .map(ProcInfo::from_process)
            .collect()
    }

    pub fn kill_tree(&mut self, pid: u32) {
        self.system.refresh_processes();

        let target = Pid::from_u32(pid);
        let children: Vec<Pid> = self
            .system
            .processes()
            .values()
            .filter(|p| p.parent() == Some(target))
            .map(|p| p.pid())
            .collect();

        for child in children {
            self.kill_tree(child.as_u32());
        }

        if let Some(process) = self.system.process(target) {
            process.kill();
        }
    }
}

#[derive(Clone, Debug)]
pub struct SystemInfo {
    pub total_memory_kib: u64,
    pub used_memory_kib: u64,
    pub free_memory_kib: u64,
    pub total_swap_kib: u64,
    pub used_swap_kib: u64,
    pub uptime: u64,
    pub load_avg_1min: f64,
    pub load_avg_5min: f64,
    pub load_avg_15min: f64,
    pub cpu_usage: f32,
}

#[derive(Clone, Debug)]
pub struct ProcInfo {
    pub pid: u32,
    pub name: String,
    pub cmd: Vec<String>,
    pub status: String,
    pub cpu_usage: f32,
    pub memory_kb: u64,
    pub virtual_memory_kb: u64,
}

impl ProcInfo {
    fn from_process(pi: &sysinfo::Process) -> Self {
        Self {
            pid: pi.pid().as_u32(),
            name: pi.name().into(),
            cmd: pi.cmd().to_vec(),
            status: format!("{}", pi.status()),
            cpu_usage: pi.cpu_usage(),
            memory_kb: pi.memory(),
            virtual_memory_kb: pi.virtual_memory(),
        }
    }
}
