//! Rate limiting logic and state management.

mod clock;
mod counter;
mod key;
mod limiter;
mod normalize;
mod rules;
mod store;

pub use clock::{Clock, ManualClock, SystemClock};
pub use counter::{AcquireResult, WindowCounter};
pub use key::CompositeKey;
pub use limiter::RateLimiter;
pub use normalize::{PathNormalizer, WILDCARD};
pub use rules::{DefaultRuleConfig, RateLimitRule, RuleTable, RuleTableConfig, DEFAULT_PATTERN};
pub use store::{CounterHandle, CounterStore};
