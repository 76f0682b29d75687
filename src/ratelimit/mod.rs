//! Rate limiting rules, keys and the decision engine.

mod backend;
mod decision;
mod descriptor;
mod key;
mod limiter;
mod rules;
mod window;

pub use backend::DecisionBackend;
pub use decision::{
    Decision, DecisionPayload, HEADER_DEGRADED, HEADER_LIMIT, HEADER_REMAINING,
    HEADER_RETRY_AFTER,
};
pub use descriptor::{RequestDescriptor, ANONYMOUS_CLIENT};
pub use key::CounterKey;
pub use limiter::{LimiterEngine, DEFAULT_KEY_PREFIX};
pub use rules::{
    HttpMethod, MethodMatcher, PathMatcher, Rule, RuleConfig, RuleSet, TimeUnit, WindowConfig,
    DEFAULT_RULE_ID,
};
pub use window::{Clock, ManualClock, SystemClock, Window};
