//! Вспомогательные функции для отладочного вывода.

use std::sync::OnceLock;

/// Возвращает `true`, если включен подробный отладочный вывод.
///
/// Управляется переменной окружения `SLM_DEBUG` (любое непустое значение).
/// Включает дорогие проверки: статистику тензоров, сравнение декодированного
/// текста с кандидатами и т.п.
pub fn enabled() -> bool {
    static ENABLED: OnceLock<bool> = OnceLock::new();
    *ENABLED.get_or_init(|| std::env::var_os("SLM_DEBUG").is_some_and(|v| !v.is_empty()))
}
