use std::fmt;
use std::str::FromStr;

use authgate_api::ParamMap;

pub const ROUTE_GREETING: &str = "/";
pub const ROUTE_LOGIN_USER: &str = "/login/{username}";
pub const ROUTE_LOGIN: &str = "/login";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Method {
    Get,
    Head,
    Post,
    Put,
    Patch,
    Delete,
    Options,
}

impl Method {
    pub fn as_str(self) -> &'static str {
        match self {
            Method::Get => "GET",
            Method::Head => "HEAD",
            Method::Post => "POST",
            Method::Put => "PUT",
            Method::Patch => "PATCH",
            Method::Delete => "DELETE",
            Method::Options => "OPTIONS",
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownMethod(pub String);

impl fmt::Display for UnknownMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unsupported HTTP method {}", self.0)
    }
}

impl std::error::Error for UnknownMethod {}

impl FromStr for Method {
    type Err = UnknownMethod;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let method = match s.to_ascii_uppercase().as_str() {
            "GET" => Method::Get,
            "HEAD" => Method::Head,
            "POST" => Method::Post,
            "PUT" => Method::Put,
            "PATCH" => Method::Patch,
            "DELETE" => Method::Delete,
            "OPTIONS" => Method::Options,
            _ => return Err(UnknownMethod(s.to_string())),
        };
        Ok(method)
    }
}

/// The closed set of handlers a route can point at.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Endpoint {
    Greeting,
    Authenticate,
    TestToken,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Literal(String),
    Param(String),
}

/// A route path such as `/login/{username}`.
///
/// A segment written as `{name}` binds the matching path segment to `name`.
/// Anything else must match literally.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathTemplate {
    raw: String,
    segments: Vec<Segment>,
}

impl PathTemplate {
    pub fn new(raw: &str) -> Self {
        let segments = split_path(raw)
            .into_iter()
            .map(|seg| match seg.strip_prefix('{').and_then(|s| s.strip_suffix('}')) {
                Some(name) if !name.is_empty() => Segment::Param(name.to_string()),
                _ => Segment::Literal(seg.to_string()),
            })
            .collect();
        Self {
            raw: raw.to_string(),
            segments,
        }
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }

    /// The template in `/:name` router syntax.
    pub fn router_syntax(&self) -> String {
        if self.segments.is_empty() {
            return "/".to_string();
        }
        let mut out = String::new();
        for seg in &self.segments {
            out.push('/');
            match seg {
                Segment::Literal(lit) => out.push_str(lit),
                Segment::Param(name) => {
                    out.push(':');
                    out.push_str(name);
                }
            }
        }
        out
    }

    pub fn param_names(&self) -> impl Iterator<Item = &str> {
        self.segments.iter().filter_map(|seg| match seg {
            Segment::Param(name) => Some(name.as_str()),
            Segment::Literal(_) => None,
        })
    }

    /// Match a concrete request path (without query string), returning the
    /// bound parameters with percent-encoding removed.
    pub fn matches(&self, path: &str) -> Option<ParamMap> {
        let parts = split_path(path);
        if parts.len() != self.segments.len() {
            return None;
        }
        let mut params = ParamMap::new();
        for (seg, part) in self.segments.iter().zip(parts) {
            match seg {
                Segment::Literal(lit) if lit == part => {}
                Segment::Literal(_) => return None,
                Segment::Param(_) if part.is_empty() => return None,
                Segment::Param(name) => {
                    let value = urlencoding::decode(part)
                        .map_or_else(|_| part.to_string(), |v| v.into_owned());
                    params.insert(name.clone(), value);
                }
            }
        }
        Some(params)
    }
}

impl fmt::Display for PathTemplate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

// "/" has no segments; "/a/b" has two; a trailing slash adds an empty one.
fn split_path(path: &str) -> Vec<&str> {
    let rest = path.strip_prefix('/').unwrap_or(path);
    if rest.is_empty() {
        Vec::new()
    } else {
        rest.split('/').collect()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Route {
    pub method: Method,
    pub template: PathTemplate,
    pub endpoint: Endpoint,
}

impl Route {
    pub fn new(method: Method, template: &str, endpoint: Endpoint) -> Self {
        Self {
            method,
            template: PathTemplate::new(template),
            endpoint,
        }
    }

    /// `METHOD` immediately followed by the template, e.g. `GET/login`.
    pub fn dispatch_key(&self) -> String {
        format!("{}{}", self.method, self.template)
    }

    fn answers(&self, method: Method) -> bool {
        self.method == method || (self.method == Method::Get && method == Method::Head)
    }
}

/// Outcome of matching a live request against the table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution<'a> {
    Matched { route: &'a Route, params: ParamMap },
    /// No route for this method. `allowed` lists the methods registered for
    /// the path, empty when no template matches at all.
    NotFound { allowed: Vec<Method> },
}

/// Immutable after construction. When two routes share a dispatch key the
/// first one wins.
#[derive(Debug, Clone)]
pub struct RouteTable {
    routes: Vec<Route>,
}

impl RouteTable {
    pub fn new(routes: Vec<Route>) -> Self {
        Self { routes }
    }

    /// `GET /`, `POST /login/{username}` and `GET /login`.
    pub fn standard() -> Self {
        Self::new(vec![
            Route::new(Method::Get, ROUTE_GREETING, Endpoint::Greeting),
            Route::new(Method::Post, ROUTE_LOGIN_USER, Endpoint::Authenticate),
            Route::new(Method::Get, ROUTE_LOGIN, Endpoint::TestToken),
        ])
    }

    pub fn routes(&self) -> &[Route] {
        &self.routes
    }

    /// Exact lookup by method and template text; no path matching.
    pub fn lookup(&self, method: &str, template: &str) -> Option<&Route> {
        let key = format!("{}{template}", method.to_ascii_uppercase());
        self.routes.iter().find(|r| r.dispatch_key() == key)
    }

    pub fn resolve(&self, method: Method, path: &str) -> Resolution<'_> {
        for route in &self.routes {
            if !route.answers(method) {
                continue;
            }
            if let Some(params) = route.template.matches(path) {
                return Resolution::Matched { route, params };
            }
        }
        Resolution::NotFound {
            allowed: self.allowed_methods(path),
        }
    }

    /// Methods registered for any template matching `path`, in table order.
    /// `GET` routes also contribute `HEAD`.
    pub fn allowed_methods(&self, path: &str) -> Vec<Method> {
        let mut methods = Vec::new();
        for route in &self.routes {
            if route.template.matches(path).is_none() {
                continue;
            }
            let mut push = |m: Method| {
                if !methods.contains(&m) {
                    methods.push(m);
                }
            };
            push(route.method);
            if route.method == Method::Get {
                push(Method::Head);
            }
        }
        methods
    }
}
