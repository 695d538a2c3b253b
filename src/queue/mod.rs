/*!
 * 队列层
 *
 * 职责：
 * - events: 任务生命周期事件
 * - planner: 把任务提示词规划成有序步骤
 * - executor: 逐步执行计划并落库消息
 * - task_queue: 每工作区的单工作者调度循环
 */

pub mod events;
pub mod executor;
pub mod planner;
pub mod task_queue;

pub use events::{QueueEvent, QueueEventEnvelope};
pub use executor::{ExecutionOutcome, ExecutorHooks, TaskExecutor};
pub use planner::TaskPlanner;
pub use task_queue::{TaskQueue, TaskQueueConfig};
