//! Promotional footer content for the promo render variant.

use rand::seq::SliceRandom;
use serde_json::{Map, Value};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Promo {
    pub title: &'static str,
    pub text: &'static str,
    pub link: &'static str,
}

pub const PROMOS: [Promo; 2] = [
    Promo {
        title: "流光卡片",
        text: "让分享更美好",
        link: "https://textcard.shushiai.com/zh",
    },
    Promo {
        title: "扫码添加微信",
        text: "插件作者：嵬hacking",
        link: "https://u.wechat.com/MLY1YU64xqoNul2tibIJo6A",
    },
];

/// Overwrite the QR code fields of `body` with one random table entry.
pub fn apply_random_promo(body: &mut Map<String, Value>) -> Promo {
    let promo = *PROMOS
        .choose(&mut rand::thread_rng())
        .unwrap_or(&PROMOS[0]);
    apply_promo(body, &promo);
    promo
}

pub fn apply_promo(body: &mut Map<String, Value>, promo: &Promo) {
    body.insert("qrcodetitle".into(), Value::String(promo.title.into()));
    body.insert("qrcodetext".into(), Value::String(promo.text.into()));
    body.insert("qrcode".into(), Value::String(promo.link.into()));
}
