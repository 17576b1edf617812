pub mod action;
pub mod condition;
pub mod events;
pub mod order;
pub mod strategy;

pub use action::{OrderSide, OrderType, TradeAction};
pub use condition::{
    CompareOp, Condition, ConditionState, ConditionType, EvaluationWindow, Metric, PriceBasis,
    TriggerMode,
};
pub use events::{ActivationRecord, StrategyEvent, StrategyRun, TradeLogEntry, VerificationEvent};
pub use order::{Order, OrderPayload, OrderStatus, RollLeg, TradeInstruction};
pub use strategy::{
    ConditionLogic, ExpireMode, Market, SecType, Strategy, StrategyStatus, StrategySymbol,
    SymbolTradeType, TradeType,
};
