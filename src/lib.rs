//! Manga Scraper 核心库。
//!
//! 代码结构（读代码入口）：
//! - `dispatch`：主上下文（HomeLoop）与回调投递（Marshaller）
//! - `queue`：单线程后台请求队列，两级优先级，空闲通知
//! - `gate`：先到先得的并发下载名额
//! - `download`：单章下载状态机、下载管理器与进度条
//! - `scraper` / `library`：内容源插件与下载记录接口
//! - `session`：搜索、章节加载、批量下载的主上下文协调者
//! - `sources`：内置本地目录内容源与下载格式
//! - `base_system`：配置与日志基础设施

pub mod base_system;
pub mod dispatch;
pub mod download;
pub mod gate;
pub mod library;
pub mod queue;
pub mod scraper;
pub mod session;
pub mod sources;
