//! Live change channels: the backend feed abstraction, the subscription
//! manager, and the projections fed by it.

mod feed;
mod manager;
mod live;

pub use feed::{ChangeEvent, ChangeFeed, ChangeFilter, ChangeKind, ChannelHandle, ChannelStatus, FeedMessage, FeedReceiver, ResourceKey};
pub use manager::{ChangeHandler, ChannelManager, ConnectionHealth, ConnectionState};
pub use live::{attendance_change, attendance_handler, course_handler, session_status_handler, CourseNotice, LiveViews, ATTENDANCE_TABLE, SESSIONS_TABLE};
