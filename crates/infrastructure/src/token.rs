use bots_core::models::TOKEN_LENGTH;
use rand::distr::Alphanumeric;
use rand::Rng;

/// 生成 32 位 `[A-Za-z0-9]` 随机令牌。唯一性由存储层检查。
pub fn generate_token() -> String {
    rand::rng()
        .sample_iter(&Alphanumeric)
        .take(TOKEN_LENGTH)
        .map(char::from)
        .collect()
}
