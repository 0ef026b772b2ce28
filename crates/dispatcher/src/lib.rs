//! 周期性维护进程
//!
//! 延迟任务提升、停滞任务回收和重复任务展开都是独立的周期进程，
//! 与Worker共享同一份存储状态，可以在任意多个进程中同时运行。

pub mod controller;
pub mod cron_utils;
pub mod delayed_promoter;
pub mod maintenance_task;
pub mod repeat_scheduler;
pub mod stalled_reaper;

pub use controller::{MaintenanceController, MaintenanceSummary};
pub use cron_utils::CronScheduler;
pub use delayed_promoter::DelayedPromoter;
pub use maintenance_task::MaintenanceTask;
pub use repeat_scheduler::{Expansion, RepeatSchedule, RepeatScheduler};
pub use stalled_reaper::{ReapSummary, StalledReaper, StalledReaperConfig};
