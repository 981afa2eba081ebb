mod table;

pub use table::{
    ApiHandler, HeaderMatcher, MethodFilter, PathPattern, Route, RouteDecision, RouteKind,
    RouteTable, RoutingRequest,
};
