//! Cycle detection along a logical call path.
//!
//! Code that re-enters itself through a chain of nested calls (pricing rules
//! resolving other pricing rules, aggregations fanning out to themselves) can
//! record a breadcrumb per step and bail out the moment a step repeats.

use std::any::{Any, TypeId};
use std::sync::Arc;

use crate::context::Context;

/// An identifier that can be recorded in a breadcrumb chain.
///
/// Implemented automatically for any `PartialEq + Debug + Send + Sync`
/// type. Distinct ID types never compare equal, even when their underlying
/// values do, so independent subsystems can use the same context without
/// colliding. Define a dedicated ID type per subsystem rather than using a
/// bare `String` or integer.
pub trait BreadcrumbId: Any + Send + Sync + std::fmt::Debug {
    /// The identifier as a dynamic value, used for type-scoped lookups.
    fn as_any(&self) -> &dyn Any;

    /// Whether `other` has both the same dynamic type and the same value.
    fn eq_id(&self, other: &dyn BreadcrumbId) -> bool;
}

impl<T> BreadcrumbId for T
where
    T: PartialEq + Any + Send + Sync + std::fmt::Debug,
{
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn eq_id(&self, other: &dyn BreadcrumbId) -> bool {
        other.as_any().downcast_ref::<T>().is_some_and(|other| other == self)
    }
}

/// One step in the chain.
///
/// `outer` links to the breadcrumb that was visible when this one was
/// attached, regardless of ID type; `prev` links to the nearest earlier
/// breadcrumb whose ID has the same dynamic type. Cycle checks only ever walk
/// `prev`, so chains of different ID types stay isolated from each other.
#[derive(Debug)]
struct Breadcrumb {
    id: Box<dyn BreadcrumbId>,
    outer: Option<Arc<Breadcrumb>>,
    prev: Option<Arc<Breadcrumb>>,
}

/// Records `id` as a breadcrumb on the context.
///
/// Returns a derived context if `id` has not been seen before among the
/// breadcrumbs of the same ID type. Returns `None` if it has, meaning the
/// execution path has come back around to a step it already visited.
pub fn with_acyclic_breadcrumb<I: BreadcrumbId>(ctx: &Context, id: I) -> Option<Context> {
    let head = ctx.value::<Breadcrumb>();
    let prev = find_prev(head.as_ref(), id.as_any().type_id());

    let mut current = prev.clone();
    while let Some(node) = current {
        if node.id.eq_id(&id) {
            return None;
        }
        current = node.prev.clone();
    }

    let node = Breadcrumb {
        id: Box::new(id),
        outer: head,
        prev,
    };

    Some(ctx.with_value(node))
}

/// Returns the nearest breadcrumb whose ID has the given dynamic type, or
/// `None` if no such breadcrumb exists.
fn find_prev(head: Option<&Arc<Breadcrumb>>, type_id: TypeId) -> Option<Arc<Breadcrumb>> {
    let mut current = head;
    while let Some(node) = current {
        if node.id.as_any().type_id() == type_id {
            return Some(Arc::clone(node));
        }
        current = node.outer.as_ref();
    }

    None
}
