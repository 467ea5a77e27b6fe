//! `Order` (§3) — created on call accept, cleared on call end. One active
//! Order per process, mirroring the Call singleton.

use chrono::{DateTime, Utc};
use serde::Serialize;

#[derive(Debug, Clone, Serialize)]
pub struct OrderItem {
    pub article_nr: String,
    pub quantity: u32,
    pub product_name: String,
    pub added_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct Order {
    pub caller_id: String,
    pub started_at: DateTime<Utc>,
    pub items: Vec<OrderItem>,
}

impl Order {
    pub fn new(caller_id: String) -> Self {
        Self {
            caller_id,
            started_at: Utc::now(),
            items: Vec::new(),
        }
    }

    /// Add an item. Quantities for the same article-nr are consolidated
    /// (§3, §8 idempotence property).
    pub fn add(&mut self, article_nr: &str, quantity: u32, product_name: &str) {
        if let Some(existing) = self.items.iter_mut().find(|i| i.article_nr == article_nr) {
            existing.quantity += quantity;
            return;
        }
        self.items.push(OrderItem {
            article_nr: article_nr.to_string(),
            quantity,
            product_name: product_name.to_string(),
            added_at: Utc::now(),
        });
    }

    /// Render as human-readable text for `show_order` / `order_update` (pure, no side effects).
    pub fn render(&self) -> String {
        if self.items.is_empty() {
            return "Die Bestellung ist noch leer.".to_string();
        }
        self.items
            .iter()
            .map(|item| format!("{}x {} (Art. {})", item.quantity, item.product_name, item.article_nr))
            .collect::<Vec<_>>()
            .join("\n")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn add_twice_consolidates_quantity() {
        let mut order = Order::new("sip:caller@x".into());
        order.add("294540", 10, "Profipress Bogen 90° 22mm");
        order.add("294540", 5, "Profipress Bogen 90° 22mm");
        assert_eq!(order.items.len(), 1);
        assert_eq!(order.items[0].quantity, 15);
    }

    #[test]
    fn different_articles_stay_separate() {
        let mut order = Order::new("sip:caller@x".into());
        order.add("1", 1, "A");
        order.add("2", 1, "B");
        assert_eq!(order.items.len(), 2);
    }

    #[test]
    fn render_is_pure() {
        let mut order = Order::new("sip:caller@x".into());
        order.add("294540", 10, "Profipress Bogen 90° 22mm");
        let first = order.render();
        let second = order.render();
        assert_eq!(first, second);
        assert_eq!(order.items.len(), 1);
    }

    #[test]
    fn empty_order_renders_placeholder() {
        let order = Order::new("sip:caller@x".into());
        assert_eq!(order.render(), "Die Bestellung ist noch leer.");
    }
}
